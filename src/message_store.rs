//! Message store: the durable, per-chat ordered log.
//!
//! Appends to one chat are serialized by a per-chat lock that is held from
//! the transaction through the publish, so subscribers see inserts in `seq`
//! order. Any later event about a message in that chat takes the same lock
//! before publishing, which keeps it behind the insert it refers to.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::LimitsConfig;
use crate::directory::{self, Directory};
use crate::error::{AppError, Result};
use crate::events::{Event, Notification, Topic};
use crate::fanout::Hub;
use crate::models::*;
use crate::storage::Storage;

const DEFAULT_PAGE_SIZE: i64 = 50;
const PROMOTION_BATCH: i64 = 100;

/// One lock per chat; different chats never contend.
#[derive(Default)]
pub struct Sequencer {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Sequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(chat_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Publish behind any in-flight append to the same chat.
    pub async fn publish_ordered(&self, hub: &Hub, chat_id: &str, event: Event) {
        let _guard = self.lock(chat_id).await;
        hub.publish(&Topic::chat(chat_id), event);
    }
}

pub struct MessageStore {
    storage: Arc<Storage>,
    directory: Arc<dyn Directory>,
    hub: Arc<Hub>,
    sequencer: Arc<Sequencer>,
    limits: LimitsConfig,
}

impl MessageStore {
    pub fn new(
        storage: Arc<Storage>,
        directory: Arc<dyn Directory>,
        hub: Arc<Hub>,
        sequencer: Arc<Sequencer>,
        limits: LimitsConfig,
    ) -> Self {
        Self {
            storage,
            directory,
            hub,
            sequencer,
            limits,
        }
    }

    // ========================================================================
    // Append
    // ========================================================================

    /// Append a message, or park it until `scheduled_for` if that is in the future.
    pub async fn append(&self, chat_id: &str, sender_id: &str, new: NewMessage) -> Result<AppendOutcome> {
        new.validate(self.limits.max_message_chars)?;
        self.ensure_can_post(chat_id, sender_id).await?;

        if let Some(reply_to_id) = &new.reply_to_id {
            let target = self
                .storage
                .get_message(reply_to_id)
                .await?
                .ok_or_else(|| AppError::not_found("reply target"))?;
            if target.chat_id != chat_id {
                return Err(AppError::validation("reply target belongs to another chat"));
            }
        }

        match new.scheduled_for {
            Some(at) if at > now_ms() => {
                let scheduled = self
                    .storage
                    .insert_scheduled(chat_id, sender_id, &new, at)
                    .await?;
                tracing::debug!("Scheduled message {} for {}", scheduled.id, at);
                Ok(AppendOutcome::Scheduled(scheduled))
            }
            _ => Ok(AppendOutcome::Live(self.insert_live(chat_id, sender_id, &new).await?)),
        }
    }

    async fn insert_live(&self, chat_id: &str, sender_id: &str, new: &NewMessage) -> Result<Message> {
        let _guard = self.sequencer.lock(chat_id).await;
        let message = self.storage.insert_message(chat_id, sender_id, new).await?;
        self.announce_insert(&message).await;
        Ok(message)
    }

    /// Publish a committed insert. Call with the chat's sequencer lock held.
    async fn announce_insert(&self, message: &Message) {
        self.hub.publish(
            &Topic::chat(message.chat_id.as_str()),
            Event::MessageInserted(message.clone()),
        );

        // The insert is durable; failing to notify must not surface as a send failure.
        let members = match self.directory.members(&message.chat_id).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!("Skipping notifications for {}: {}", message.id, e);
                return;
            }
        };

        let preview = message.preview();
        for member in members.iter().filter(|m| m.user_id != message.sender_id) {
            let topic = Topic::user(member.user_id.as_str());
            self.hub.publish(
                &topic,
                Event::Notification(Notification {
                    chat_id: message.chat_id.clone(),
                    message_id: message.id.clone(),
                    sender_id: message.sender_id.clone(),
                    preview: preview.clone(),
                    muted: member.is_muted,
                }),
            );
            self.hub.publish(
                &topic,
                Event::UnreadChanged {
                    chat_id: message.chat_id.clone(),
                    unread_count: member.unread_count,
                },
            );
        }
    }

    /// Membership, role and, in private chats, the recipient's `allow_messages_from`.
    async fn ensure_can_post(&self, chat_id: &str, sender_id: &str) -> Result<Chat> {
        let chat = self
            .directory
            .chat(chat_id)
            .await?
            .ok_or_else(|| AppError::not_found("chat"))?;

        let role = self
            .directory
            .get_role(chat_id, sender_id)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;

        if !role.can_post(chat.chat_type) {
            return Err(AppError::permission("your role cannot post in this chat"));
        }

        if chat.chat_type == ChatType::Private {
            for other in self.directory.member_ids(chat_id).await? {
                if other == sender_id {
                    continue;
                }
                let prefs = self.directory.resolve_privacy_prefs(&other).await?;
                if !directory::permits(self.directory.as_ref(), prefs.allow_messages_from, &other, sender_id)
                    .await?
                {
                    return Err(AppError::permission("this user does not accept your messages"));
                }
            }
        }

        Ok(chat)
    }

    // ========================================================================
    // Edit / Delete / Forward
    // ========================================================================

    /// Change the text of your own text message. Status is left untouched.
    pub async fn edit(&self, message_id: &str, editor_id: &str, content: &str) -> Result<Message> {
        let message = self.load(message_id).await?;

        if message.sender_id != editor_id {
            return Err(AppError::permission("only the author can edit a message"));
        }
        if message.is_deleted {
            return Err(AppError::invalid_state("message was deleted"));
        }
        if !message.msg_type.is_editable() {
            return Err(AppError::invalid_state("only text messages can be edited"));
        }
        NewMessage::text(content).validate(self.limits.max_message_chars)?;

        let updated = self
            .storage
            .update_content(message_id, content)
            .await?
            .ok_or_else(|| AppError::invalid_state("message was deleted"))?;

        self.sequencer
            .publish_ordered(&self.hub, &updated.chat_id, Event::MessageUpdated(updated.clone()))
            .await;

        Ok(updated)
    }

    /// Soft delete. Repeating it is a no-op.
    pub async fn soft_delete(&self, message_id: &str, requester_id: &str) -> Result<()> {
        let message = self.load(message_id).await?;

        if message.sender_id != requester_id {
            return Err(AppError::permission("only the author can delete a message"));
        }

        if let Some(deleted) = self.storage.soft_delete(message_id).await? {
            tracing::info!("Message {} deleted by {}", message_id, requester_id);
            let chat_id = deleted.chat_id.clone();
            self.sequencer
                .publish_ordered(&self.hub, &chat_id, Event::MessageDeleted(deleted.tombstoned()))
                .await;
        }

        Ok(())
    }

    /// Copy `source_message_id` into `target_chat_id`. The copy is independent
    /// of the original from then on.
    pub async fn forward(&self, target_chat_id: &str, forwarder_id: &str, source_message_id: &str) -> Result<Message> {
        let source = self.load(source_message_id).await?;

        if !self.directory.is_member(&source.chat_id, forwarder_id).await? {
            return Err(AppError::permission("not a member of the source chat"));
        }
        if source.is_deleted {
            return Err(AppError::not_found("message"));
        }
        self.ensure_can_post(target_chat_id, forwarder_id).await?;

        let copy = NewMessage {
            content: source.content.clone(),
            msg_type: source.msg_type,
            media_url: source.media_url.clone(),
            media_duration: source.media_duration,
            reply_to_id: None,
            forwarded_from_id: Some(source.id.clone()),
            is_one_time: false,
            scheduled_for: None,
        };

        self.insert_live(target_chat_id, forwarder_id, &copy).await
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// One page of the chat in append order, starting after `after_seq`.
    ///
    /// Deleted messages come back as tombstones except to their author, or
    /// to an owner/admin with `audit` set.
    pub async fn list_by_chat(
        &self,
        chat_id: &str,
        requester_id: &str,
        after_seq: Option<i64>,
        limit: Option<i64>,
        audit: bool,
    ) -> Result<MessagePage> {
        let role = self
            .directory
            .get_role(chat_id, requester_id)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;

        if audit && !role.can_manage() {
            return Err(AppError::permission("auditing requires owner or admin"));
        }

        let limit = limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, self.limits.max_page_size.max(1));

        let mut rows = self
            .storage
            .list_messages(chat_id, after_seq.unwrap_or(0), limit + 1)
            .await?;

        let has_more = rows.len() as i64 > limit;
        rows.truncate(limit as usize);
        let next_cursor = if has_more { rows.last().map(|m| m.seq) } else { None };

        let mut messages = Vec::with_capacity(rows.len());
        for message in rows {
            let reply_to = match &message.reply_to_id {
                Some(id) => self.storage.get_message(id).await?.map(MessageRef::from_message),
                None => None,
            };
            let message = if audit { message } else { message.visible_to(requester_id) };
            messages.push(MessageView { message, reply_to });
        }

        Ok(MessagePage { messages, next_cursor })
    }

    /// Back-reference for reply and forward previews. A deleted target is a
    /// tombstone, not an error.
    pub async fn resolve_reference(&self, message_id: &str, viewer_id: &str) -> Result<MessageRef> {
        let message = self.load(message_id).await?;

        if !self.directory.is_member(&message.chat_id, viewer_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }

        Ok(MessageRef::from_message(message))
    }

    /// Single message as seen by a member.
    pub async fn get(&self, message_id: &str, viewer_id: &str) -> Result<Message> {
        let message = self.load(message_id).await?;

        if !self.directory.is_member(&message.chat_id, viewer_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }

        Ok(message.visible_to(viewer_id))
    }

    async fn load(&self, message_id: &str) -> Result<Message> {
        self.storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| AppError::not_found("message"))
    }

    // ========================================================================
    // Scheduled Messages
    // ========================================================================

    pub async fn list_scheduled(&self, sender_id: &str, chat_id: Option<&str>) -> Result<Vec<ScheduledMessage>> {
        self.storage.list_scheduled(sender_id, chat_id).await
    }

    /// Change text and/or time of a pending entry you own.
    pub async fn edit_scheduled(
        &self,
        scheduled_id: &str,
        sender_id: &str,
        content: Option<&str>,
        scheduled_for: Option<i64>,
    ) -> Result<ScheduledMessage> {
        let scheduled = self.load_scheduled(scheduled_id, sender_id).await?;

        if let Some(content) = content {
            if !scheduled.msg_type.is_editable() {
                return Err(AppError::invalid_state("only text messages can be edited"));
            }
            NewMessage::text(content).validate(self.limits.max_message_chars)?;
        }
        if let Some(at) = scheduled_for {
            if at <= now_ms() {
                return Err(AppError::validation("scheduled time must be in the future"));
            }
        }

        self.storage
            .update_scheduled(scheduled_id, content, scheduled_for)
            .await?
            .ok_or_else(|| AppError::invalid_state("scheduled message is no longer pending"))
    }

    pub async fn cancel_scheduled(&self, scheduled_id: &str, sender_id: &str) -> Result<ScheduledMessage> {
        self.load_scheduled(scheduled_id, sender_id).await?;

        self.storage
            .cancel_scheduled(scheduled_id)
            .await?
            .ok_or_else(|| AppError::invalid_state("scheduled message is no longer pending"))
    }

    async fn load_scheduled(&self, scheduled_id: &str, sender_id: &str) -> Result<ScheduledMessage> {
        let scheduled = self
            .storage
            .get_scheduled(scheduled_id)
            .await?
            .ok_or_else(|| AppError::not_found("scheduled message"))?;

        if scheduled.sender_id != sender_id {
            return Err(AppError::permission("not your scheduled message"));
        }
        if scheduled.state != ScheduledState::Pending {
            return Err(AppError::invalid_state("scheduled message is no longer pending"));
        }

        Ok(scheduled)
    }

    /// Turn every due entry into a live message. Returns how many went live.
    ///
    /// Each entry is independent: one that can no longer be posted is marked
    /// failed and the sweep moves on.
    pub async fn promote_due(&self, now: i64) -> Result<usize> {
        let due = self.storage.due_scheduled(now, PROMOTION_BATCH).await?;
        let mut promoted = 0;

        for scheduled in due {
            if let Err(e) = self.ensure_can_post(&scheduled.chat_id, &scheduled.sender_id).await {
                tracing::warn!("Dropping scheduled message {}: {}", scheduled.id, e);
                self.storage.fail_scheduled(&scheduled.id).await?;
                continue;
            }

            let _guard = self.sequencer.lock(&scheduled.chat_id).await;
            match self.storage.promote_scheduled(&scheduled, now).await {
                Ok(Some(message)) => {
                    self.announce_insert(&message).await;
                    promoted += 1;
                }
                Ok(None) => {}
                Err(e) => tracing::error!("Failed to promote scheduled message {}: {}", scheduled.id, e),
            }
        }

        if promoted > 0 {
            tracing::info!("Promoted {} scheduled messages", promoted);
        }
        Ok(promoted)
    }
}
