//! Process-wide registry of live WebSocket sessions.

use dashmap::DashMap;

use crate::crypto;
use crate::models::now_ms;

/// One authenticated WebSocket connection.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub user_id: String,
    pub connected_at: i64,
}

/// Outcome of registering or unregistering a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The user's first live session started, or their last one ended.
    Edge,
    /// Other sessions of the user are still live.
    Unchanged,
}

pub struct SessionRegistry {
    /// user_id -> live sessions (multiple devices per user)
    sessions: DashMap<String, Vec<SessionInfo>>,
    /// session_id -> user_id for quick lookup
    session_to_user: DashMap<String, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            session_to_user: DashMap::new(),
        }
    }

    /// Start a session for `user_id`.
    pub fn register(&self, user_id: &str) -> (SessionInfo, Transition) {
        let info = SessionInfo {
            session_id: crypto::new_id(),
            user_id: user_id.to_string(),
            connected_at: now_ms(),
        };

        let transition = {
            let mut entry = self.sessions.entry(user_id.to_string()).or_default();
            entry.push(info.clone());
            if entry.len() == 1 {
                Transition::Edge
            } else {
                Transition::Unchanged
            }
        };

        self.session_to_user
            .insert(info.session_id.clone(), user_id.to_string());

        tracing::info!("Session registered: user={}, session={}", user_id, info.session_id);
        (info, transition)
    }

    /// End a session. Returns the owner and whether it was their last one.
    pub fn unregister(&self, session_id: &str) -> Option<(String, Transition)> {
        let (_, user_id) = self.session_to_user.remove(session_id)?;

        if let Some(mut sessions) = self.sessions.get_mut(&user_id) {
            sessions.retain(|s| s.session_id != session_id);
        }

        let last = self
            .sessions
            .remove_if(&user_id, |_, sessions| sessions.is_empty())
            .is_some();

        tracing::info!("Session unregistered: user={}, session={}", user_id, session_id);

        let transition = if last {
            Transition::Edge
        } else {
            Transition::Unchanged
        };
        Some((user_id, transition))
    }

    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.sessions
            .get(user_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
    }

    pub fn sessions_for(&self, user_id: &str) -> Vec<SessionInfo> {
        self.sessions
            .get(user_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn online_user_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_count(&self) -> usize {
        self.session_to_user.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_lifecycle() {
        let registry = SessionRegistry::new();

        let (first, t) = registry.register("user1");
        assert_eq!(t, Transition::Edge);
        assert!(registry.is_user_online("user1"));
        assert!(!registry.is_user_online("user2"));

        // Second device for the same user
        let (second, t) = registry.register("user1");
        assert_eq!(t, Transition::Unchanged);
        assert_eq!(registry.sessions_for("user1").len(), 2);
        assert_eq!(registry.session_count(), 2);

        assert_eq!(
            registry.unregister(&first.session_id),
            Some(("user1".to_string(), Transition::Unchanged))
        );
        assert!(registry.is_user_online("user1"));

        assert_eq!(
            registry.unregister(&second.session_id),
            Some(("user1".to_string(), Transition::Edge))
        );
        assert!(!registry.is_user_online("user1"));
        assert_eq!(registry.online_user_count(), 0);

        // Unknown or already-removed sessions are ignored.
        assert_eq!(registry.unregister(&second.session_id), None);
    }
}
