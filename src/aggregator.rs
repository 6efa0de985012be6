//! Derived counters: per-emoji reaction tallies and per-member unread counts.
//!
//! Unread increments happen inside the append transaction (one per member
//! other than the sender), so they never drift from the log. A reset
//! recomputes from the log in the same statement that moves the read mark.

use std::sync::Arc;

use crate::directory::Directory;
use crate::error::{AppError, Result};
use crate::events::{Event, Topic};
use crate::fanout::Hub;
use crate::message_store::Sequencer;
use crate::models::*;
use crate::storage::Storage;

pub struct Aggregator {
    storage: Arc<Storage>,
    directory: Arc<dyn Directory>,
    hub: Arc<Hub>,
    sequencer: Arc<Sequencer>,
    max_emoji_bytes: usize,
}

impl Aggregator {
    pub fn new(
        storage: Arc<Storage>,
        directory: Arc<dyn Directory>,
        hub: Arc<Hub>,
        sequencer: Arc<Sequencer>,
        max_emoji_bytes: usize,
    ) -> Self {
        Self {
            storage,
            directory,
            hub,
            sequencer,
            max_emoji_bytes,
        }
    }

    // ========================================================================
    // Reactions
    // ========================================================================

    /// Add the reaction if absent, remove it if present. Returns the
    /// recomputed tally as the caller sees it.
    pub async fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<AggregateReactions> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.len() > self.max_emoji_bytes {
            return Err(AppError::validation("invalid emoji"));
        }

        let message = self.visible_message(message_id, user_id).await?;
        if message.is_deleted {
            return Err(AppError::invalid_state("message was deleted"));
        }

        let added = self.storage.toggle_reaction(message_id, user_id, emoji).await?;
        tracing::debug!(
            "Reaction {} {} on {} by {}",
            emoji,
            if added { "added" } else { "removed" },
            message_id,
            user_id
        );

        let rows = self.storage.reaction_rows(message_id).await?;

        // Subscribers get the viewer-neutral tally and derive `reacted` from `users`.
        let shared = AggregateReactions::from_rows(message_id, &rows, "");
        self.sequencer
            .publish_ordered(
                &self.hub,
                &message.chat_id,
                Event::ReactionsChanged {
                    chat_id: message.chat_id.clone(),
                    message_id: message_id.to_string(),
                    reactions: shared.reactions,
                },
            )
            .await;

        Ok(AggregateReactions::from_rows(message_id, &rows, user_id))
    }

    pub async fn reactions_for(&self, message_id: &str, viewer_id: &str) -> Result<AggregateReactions> {
        self.visible_message(message_id, viewer_id).await?;
        let rows = self.storage.reaction_rows(message_id).await?;
        Ok(AggregateReactions::from_rows(message_id, &rows, viewer_id))
    }

    async fn visible_message(&self, message_id: &str, user_id: &str) -> Result<Message> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| AppError::not_found("message"))?;

        if !self.directory.is_member(&message.chat_id, user_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }

        Ok(message)
    }

    // ========================================================================
    // Unread
    // ========================================================================

    /// The member viewed the chat up to `up_to_seq` (default: everything).
    /// Returns the remaining unread count.
    pub async fn reset_unread(&self, chat_id: &str, member_id: &str, up_to_seq: Option<i64>) -> Result<i64> {
        let unread_count = self
            .storage
            .reset_unread(chat_id, member_id, up_to_seq)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;

        self.hub.publish(
            &Topic::user(member_id),
            Event::UnreadChanged {
                chat_id: chat_id.to_string(),
                unread_count,
            },
        );

        Ok(unread_count)
    }

    pub async fn unread_count(&self, chat_id: &str, member_id: &str) -> Result<i64> {
        self.directory
            .membership(chat_id, member_id)
            .await?
            .map(|m| m.unread_count)
            .ok_or_else(|| AppError::permission("not a member of this chat"))
    }
}
