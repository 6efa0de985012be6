//! Presence & activity tracker. Ephemeral: nothing here touches the store.
//!
//! Every signal is best effort. Requests for unknown users, or typing in a
//! chat the user is not in, are dropped without an error.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::config::PresenceConfig;
use crate::directory::Directory;
use crate::events::{Event, Topic};
use crate::fanout::Hub;
use crate::models::*;

struct PresenceRecord {
    /// What the user asked for.
    declared: PresenceStatus,
    /// Set by the liveness sweep; shows the user offline until the next heartbeat.
    expired: bool,
    last_seen: i64,
    last_heartbeat: Instant,
}

impl PresenceRecord {
    fn effective(&self) -> PresenceStatus {
        if self.expired {
            PresenceStatus::Offline
        } else {
            self.declared
        }
    }
}

struct TypingEntry {
    indicator: TypingIndicator,
    generation: u64,
    timer: AbortHandle,
}

pub struct PresenceTracker {
    records: DashMap<String, PresenceRecord>,
    typing: DashMap<(String, String), TypingEntry>,
    generation: AtomicU64,
    directory: Arc<dyn Directory>,
    hub: Arc<Hub>,
    liveness_timeout: Duration,
    typing_ttl: Duration,
}

/// What `user_id` looks like to somebody else.
fn view_for_others(user_id: &str, status: PresenceStatus, last_seen: i64, prefs: &PrivacyPrefs) -> PresenceView {
    let shown = status.seen_by_others(prefs);
    let last_seen = if prefs.show_last_seen && status != PresenceStatus::Invisible {
        Some(last_seen)
    } else {
        None
    };

    PresenceView {
        user_id: user_id.to_string(),
        status: shown,
        last_seen,
    }
}

impl PresenceTracker {
    pub fn new(directory: Arc<dyn Directory>, hub: Arc<Hub>, config: &PresenceConfig) -> Self {
        Self {
            records: DashMap::new(),
            typing: DashMap::new(),
            generation: AtomicU64::new(0),
            directory,
            hub,
            liveness_timeout: config.liveness_timeout(),
            typing_ttl: config.typing_ttl(),
        }
    }

    // ========================================================================
    // Presence
    // ========================================================================

    /// Overwrite the user's status and tell every chat they belong to.
    pub async fn set_presence(&self, user_id: &str, status: PresenceStatus) {
        match self.directory.user_exists(user_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Ignoring presence for unknown user {}", user_id);
                return;
            }
            Err(e) => {
                tracing::warn!("Presence lookup for {} failed: {}", user_id, e);
                return;
            }
        }

        let now = now_ms();
        self.records.insert(
            user_id.to_string(),
            PresenceRecord {
                declared: status,
                expired: false,
                last_seen: now,
                last_heartbeat: Instant::now(),
            },
        );

        tracing::debug!("Presence of {} set to {:?}", user_id, status);
        self.broadcast(user_id, status, now).await;
    }

    /// Refresh liveness and last-seen. The status only changes if the sweep
    /// had expired it, in which case the declared status comes back.
    pub async fn heartbeat(&self, user_id: &str) {
        let revived = {
            let Some(mut record) = self.records.get_mut(user_id) else {
                return;
            };
            record.last_heartbeat = Instant::now();
            record.last_seen = now_ms();
            let revived = record.expired;
            record.expired = false;
            revived.then(|| (record.declared, record.last_seen))
        };

        if let Some((status, last_seen)) = revived {
            self.broadcast(user_id, status, last_seen).await;
        }
    }

    /// Expire everyone whose last heartbeat is older than the liveness window.
    /// Returns the users that went offline.
    pub async fn sweep(&self) -> Vec<String> {
        let mut expired = Vec::new();

        for mut entry in self.records.iter_mut() {
            let stale = {
                let record = entry.value();
                record.declared != PresenceStatus::Offline
                    && !record.expired
                    && record.last_heartbeat.elapsed() > self.liveness_timeout
            };
            if stale {
                entry.value_mut().expired = true;
                expired.push((entry.key().clone(), entry.value().last_seen));
            }
        }

        for (user_id, last_seen) in &expired {
            tracing::info!("Presence of {} expired", user_id);
            self.broadcast(user_id, PresenceStatus::Offline, *last_seen).await;
        }

        expired.into_iter().map(|(user_id, _)| user_id).collect()
    }

    /// First live session of the user.
    pub async fn session_started(&self, user_id: &str) {
        let invisible = self
            .records
            .get(user_id)
            .map(|r| r.declared == PresenceStatus::Invisible)
            .unwrap_or(false);

        if invisible {
            self.heartbeat(user_id).await;
        } else {
            self.set_presence(user_id, PresenceStatus::Online).await;
        }
    }

    /// Last live session of the user ended.
    pub async fn session_ended(&self, user_id: &str) {
        let invisible = self
            .records
            .get(user_id)
            .map(|r| r.declared == PresenceStatus::Invisible)
            .unwrap_or(false);

        if !invisible {
            self.set_presence(user_id, PresenceStatus::Offline).await;
        }
    }

    /// Presence of `user_id` as `viewer_id` may see it.
    pub async fn presence_of(&self, user_id: &str, viewer_id: &str) -> PresenceView {
        let (status, last_seen) = self
            .records
            .get(user_id)
            .map(|r| (r.effective(), Some(r.last_seen)))
            .unwrap_or((PresenceStatus::Offline, None));

        if user_id == viewer_id {
            return PresenceView {
                user_id: user_id.to_string(),
                status,
                last_seen,
            };
        }

        let prefs = self
            .directory
            .resolve_privacy_prefs(user_id)
            .await
            .unwrap_or_default();
        let mut view = view_for_others(user_id, status, last_seen.unwrap_or_default(), &prefs);
        if last_seen.is_none() {
            view.last_seen = None;
        }
        view
    }

    /// The owner hears the truth on their own topic; chats get the masked view.
    async fn broadcast(&self, user_id: &str, status: PresenceStatus, last_seen: i64) {
        self.hub.publish(
            &Topic::user(user_id),
            Event::PresenceChanged(PresenceView {
                user_id: user_id.to_string(),
                status,
                last_seen: Some(last_seen),
            }),
        );

        let prefs = match self.directory.resolve_privacy_prefs(user_id).await {
            Ok(prefs) => prefs,
            Err(e) => {
                tracing::warn!("Presence broadcast for {} skipped: {}", user_id, e);
                return;
            }
        };
        let view = view_for_others(user_id, status, last_seen, &prefs);

        match self.directory.chat_ids_for_user(user_id).await {
            Ok(chat_ids) => {
                for chat_id in chat_ids {
                    self.hub
                        .publish(&Topic::chat(chat_id), Event::PresenceChanged(view.clone()));
                }
            }
            Err(e) => tracing::warn!("Presence broadcast for {} skipped: {}", user_id, e),
        }
    }

    // ========================================================================
    // Typing
    // ========================================================================

    /// Start or refresh an activity indicator. It clears itself after the TTL
    /// unless refreshed; a refresh replaces the pending timer.
    pub async fn set_typing(self: &Arc<Self>, chat_id: &str, user_id: &str, activity: ActivityType) {
        match self.directory.is_member(chat_id, user_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                tracing::warn!("Typing lookup failed: {}", e);
                return;
            }
        }

        let key = (chat_id.to_string(), user_id.to_string());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let timer = {
            let tracker: Weak<Self> = Arc::downgrade(self);
            let ttl = self.typing_ttl;
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                if let Some(tracker) = tracker.upgrade() {
                    tracker.expire_typing(&key, generation);
                }
            })
            .abort_handle()
        };

        let indicator = TypingIndicator {
            chat_id: chat_id.to_string(),
            user_id: user_id.to_string(),
            activity,
            started_at: now_ms(),
        };

        let changed = match self.typing.insert(
            key,
            TypingEntry {
                indicator: indicator.clone(),
                generation,
                timer,
            },
        ) {
            Some(previous) => {
                previous.timer.abort();
                previous.indicator.activity != activity
            }
            None => true,
        };

        if changed {
            self.hub
                .publish(&Topic::chat(chat_id), Event::TypingStarted(indicator));
        }
    }

    /// Explicit early clear, e.g. on send. Pre-empts the pending timer.
    pub fn clear_typing(&self, chat_id: &str, user_id: &str) {
        let key = (chat_id.to_string(), user_id.to_string());
        if let Some((_, entry)) = self.typing.remove(&key) {
            entry.timer.abort();
            self.announce_stopped(chat_id, user_id);
        }
    }

    fn expire_typing(&self, key: &(String, String), generation: u64) {
        // A refresh that raced the timer bumped the generation; leave it alone.
        if self
            .typing
            .remove_if(key, |_, entry| entry.generation == generation)
            .is_some()
        {
            self.announce_stopped(&key.0, &key.1);
        }
    }

    fn announce_stopped(&self, chat_id: &str, user_id: &str) {
        self.hub.publish(
            &Topic::chat(chat_id),
            Event::TypingStopped {
                chat_id: chat_id.to_string(),
                user_id: user_id.to_string(),
            },
        );
    }

    /// Indicators currently active in a chat.
    pub fn typing_in(&self, chat_id: &str) -> Vec<TypingIndicator> {
        let mut indicators: Vec<TypingIndicator> = self
            .typing
            .iter()
            .filter(|entry| entry.key().0 == chat_id)
            .map(|entry| entry.indicator.clone())
            .collect();
        indicators.sort_by_key(|i| i.started_at);
        indicators
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::fanout::Delivery;

    /// Two users sharing chat "c1"; "mallory" exists but is in no chat.
    struct FakeDirectory {
        hidden: bool,
    }

    #[axum::async_trait]
    impl Directory for FakeDirectory {
        async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool> {
            Ok(chat_id == "c1" && (user_id == "alice" || user_id == "bob"))
        }
        async fn get_role(&self, _: &str, _: &str) -> Result<Option<MemberRole>> {
            Ok(Some(MemberRole::Member))
        }
        async fn resolve_privacy_prefs(&self, _: &str) -> Result<PrivacyPrefs> {
            Ok(PrivacyPrefs {
                show_online: !self.hidden,
                show_last_seen: !self.hidden,
                ..PrivacyPrefs::default()
            })
        }
        async fn membership(&self, _: &str, _: &str) -> Result<Option<ChatMembership>> {
            Ok(None)
        }
        async fn members(&self, _: &str) -> Result<Vec<ChatMembership>> {
            Ok(Vec::new())
        }
        async fn member_ids(&self, _: &str) -> Result<Vec<String>> {
            Ok(vec!["alice".into(), "bob".into()])
        }
        async fn chat(&self, _: &str) -> Result<Option<Chat>> {
            Ok(None)
        }
        async fn chat_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
            Ok(match user_id {
                "alice" | "bob" => vec!["c1".into()],
                _ => Vec::new(),
            })
        }
        async fn user_exists(&self, user_id: &str) -> Result<bool> {
            Ok(matches!(user_id, "alice" | "bob" | "mallory"))
        }
        async fn is_contact(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    fn tracker(hidden: bool) -> (Arc<PresenceTracker>, Arc<Hub>) {
        let hub = Arc::new(Hub::new(64));
        let config = PresenceConfig {
            liveness_timeout_secs: 45,
            sweep_interval_secs: 5,
            typing_ttl_ms: 3000,
        };
        let tracker = Arc::new(PresenceTracker::new(
            Arc::new(FakeDirectory { hidden }),
            Arc::clone(&hub),
            &config,
        ));
        (tracker, hub)
    }

    async fn next_event(sub: &mut crate::fanout::Subscription) -> Event {
        match sub.recv().await {
            Some(Delivery::Event(event)) => event,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_after_ttl() {
        let (tracker, hub) = tracker(false);
        let mut sub = hub.subscribe(Topic::chat("c1"));

        tracker.set_typing("c1", "alice", ActivityType::Typing).await;
        assert!(matches!(next_event(&mut sub).await, Event::TypingStarted(_)));
        assert_eq!(tracker.typing_in("c1").len(), 1);

        tokio::time::sleep(Duration::from_millis(3100)).await;
        assert!(matches!(next_event(&mut sub).await, Event::TypingStopped { .. }));
        assert!(tracker.typing_in("c1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_resets_timer_without_stacking() {
        let (tracker, _hub) = tracker(false);

        tracker.set_typing("c1", "alice", ActivityType::Typing).await;
        tokio::time::sleep(Duration::from_millis(2000)).await;
        tracker.set_typing("c1", "alice", ActivityType::Typing).await;

        // The first timer would have fired here.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(tracker.typing_in("c1").len(), 1);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert!(tracker.typing_in("c1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_preempts_timer() {
        let (tracker, hub) = tracker(false);
        let mut sub = hub.subscribe(Topic::chat("c1"));

        tracker.set_typing("c1", "bob", ActivityType::RecordingVoice).await;
        tracker.clear_typing("c1", "bob");
        assert!(matches!(next_event(&mut sub).await, Event::TypingStarted(_)));
        assert!(matches!(next_event(&mut sub).await, Event::TypingStopped { .. }));

        // No second stop from the aborted timer.
        tokio::time::sleep(Duration::from_secs(5)).await;
        tracker.set_typing("c1", "bob", ActivityType::Typing).await;
        assert!(matches!(next_event(&mut sub).await, Event::TypingStarted(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_outside_membership_is_ignored() {
        let (tracker, _hub) = tracker(false);
        tracker.set_typing("c1", "mallory", ActivityType::Typing).await;
        assert!(tracker.typing_in("c1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_liveness_sweep_marks_offline() {
        let (tracker, _hub) = tracker(false);
        tracker.set_presence("alice", PresenceStatus::Online).await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        tracker.heartbeat("alice").await;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(tracker.sweep().await.is_empty());

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(tracker.sweep().await, vec!["alice".to_string()]);
        assert_eq!(
            tracker.presence_of("alice", "bob").await.status,
            PresenceStatus::Offline
        );

        // A late heartbeat restores the declared status.
        tracker.heartbeat("alice").await;
        assert_eq!(
            tracker.presence_of("alice", "bob").await.status,
            PresenceStatus::Online
        );
    }

    #[tokio::test]
    async fn test_invisible_broadcasts_offline_to_chats() {
        let (tracker, hub) = tracker(false);
        let mut chat = hub.subscribe(Topic::chat("c1"));
        let mut own = hub.subscribe(Topic::user("alice"));

        tracker.set_presence("alice", PresenceStatus::Invisible).await;

        match next_event(&mut chat).await {
            Event::PresenceChanged(view) => {
                assert_eq!(view.status, PresenceStatus::Offline);
                assert_eq!(view.last_seen, None);
            }
            other => panic!("unexpected {:?}", other),
        }
        match next_event(&mut own).await {
            Event::PresenceChanged(view) => assert_eq!(view.status, PresenceStatus::Invisible),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hidden_online_shows_recently() {
        let (tracker, _hub) = tracker(true);
        tracker.set_presence("bob", PresenceStatus::Online).await;

        let view = tracker.presence_of("bob", "alice").await;
        assert_eq!(view.status, PresenceStatus::Recently);
        assert_eq!(view.last_seen, None);

        assert_eq!(tracker.presence_of("bob", "bob").await.status, PresenceStatus::Online);
    }

    #[tokio::test]
    async fn test_unknown_user_is_ignored() {
        let (tracker, _hub) = tracker(false);
        tracker.set_presence("ghost", PresenceStatus::Online).await;
        tracker.heartbeat("ghost").await;
        assert_eq!(
            tracker.presence_of("ghost", "alice").await.status,
            PresenceStatus::Offline
        );
    }
}
