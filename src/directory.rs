//! Identity & membership lookups consumed by every component.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{AllowFrom, Chat, ChatMembership, MemberRole, PrivacyPrefs};
use crate::storage::Storage;

#[axum::async_trait]
pub trait Directory: Send + Sync {
    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool>;

    async fn get_role(&self, chat_id: &str, user_id: &str) -> Result<Option<MemberRole>>;

    /// Unknown users resolve to the defaults.
    async fn resolve_privacy_prefs(&self, user_id: &str) -> Result<PrivacyPrefs>;

    async fn membership(&self, chat_id: &str, user_id: &str) -> Result<Option<ChatMembership>>;

    async fn members(&self, chat_id: &str) -> Result<Vec<ChatMembership>>;

    async fn member_ids(&self, chat_id: &str) -> Result<Vec<String>>;

    async fn chat(&self, chat_id: &str) -> Result<Option<Chat>>;

    async fn chat_ids_for_user(&self, user_id: &str) -> Result<Vec<String>>;

    async fn user_exists(&self, user_id: &str) -> Result<bool>;

    /// Whether `owner_id` lists `other_id` as a contact.
    async fn is_contact(&self, owner_id: &str, other_id: &str) -> Result<bool>;
}

/// Whether `owner_id`'s `rule` lets `actor_id` reach them.
pub async fn permits(
    directory: &dyn Directory,
    rule: AllowFrom,
    owner_id: &str,
    actor_id: &str,
) -> Result<bool> {
    match rule {
        AllowFrom::Everyone => Ok(true),
        AllowFrom::Contacts => directory.is_contact(owner_id, actor_id).await,
        AllowFrom::Nobody => Ok(false),
    }
}

/// Directory backed by the chat and user tables.
pub struct SqlDirectory {
    storage: Arc<Storage>,
}

impl SqlDirectory {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[axum::async_trait]
impl Directory for SqlDirectory {
    async fn is_member(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.storage.get_membership(chat_id, user_id).await?.is_some())
    }

    async fn get_role(&self, chat_id: &str, user_id: &str) -> Result<Option<MemberRole>> {
        Ok(self
            .storage
            .get_membership(chat_id, user_id)
            .await?
            .map(|m| m.role))
    }

    async fn resolve_privacy_prefs(&self, user_id: &str) -> Result<PrivacyPrefs> {
        Ok(self
            .storage
            .get_privacy_prefs(user_id)
            .await?
            .unwrap_or_default())
    }

    async fn membership(&self, chat_id: &str, user_id: &str) -> Result<Option<ChatMembership>> {
        self.storage.get_membership(chat_id, user_id).await
    }

    async fn members(&self, chat_id: &str) -> Result<Vec<ChatMembership>> {
        self.storage.list_members(chat_id).await
    }

    async fn member_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.storage.member_ids(chat_id).await
    }

    async fn chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        self.storage.get_chat(chat_id).await
    }

    async fn chat_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        self.storage.chat_ids_for_user(user_id).await
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .storage
            .get_user(user_id)
            .await?
            .map(|u| u.is_active)
            .unwrap_or(false))
    }

    async fn is_contact(&self, owner_id: &str, other_id: &str) -> Result<bool> {
        self.storage.is_contact(owner_id, other_id).await
    }
}
