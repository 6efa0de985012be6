//! Delivery state machine: `sent -> delivered -> read`, forward only.
//!
//! The store owns `sent` onwards. `sending` and `failed` belong to the
//! submitting client and never reach this module.
//!
//! Private chats keep one summary status: the other party's progress.
//! Groups and channels also keep a receipt row per member; the summary turns
//! `delivered` on the first delivery and `read` only once every recipient has
//! read, and readers are listed as "N/total".

use std::collections::HashMap;
use std::sync::Arc;

use crate::directory::Directory;
use crate::error::{AppError, Result};
use crate::events::Event;
use crate::fanout::Hub;
use crate::message_store::Sequencer;
use crate::models::*;
use crate::storage::Storage;

pub struct DeliveryTracker {
    storage: Arc<Storage>,
    directory: Arc<dyn Directory>,
    hub: Arc<Hub>,
    sequencer: Arc<Sequencer>,
}

/// Message payload safe to show every subscriber.
fn public_view(message: Message) -> Message {
    if message.is_deleted {
        message.tombstoned()
    } else {
        message
    }
}

impl DeliveryTracker {
    pub fn new(
        storage: Arc<Storage>,
        directory: Arc<dyn Directory>,
        hub: Arc<Hub>,
        sequencer: Arc<Sequencer>,
    ) -> Self {
        Self {
            storage,
            directory,
            hub,
            sequencer,
        }
    }

    /// Load every message and check the observer belongs to each chat before
    /// anything is mutated.
    async fn resolve(&self, message_ids: &[String], observer_id: &str) -> Result<Vec<(Message, Chat)>> {
        let mut chats: HashMap<String, Chat> = HashMap::new();
        let mut resolved = Vec::with_capacity(message_ids.len());

        for id in message_ids {
            let message = self
                .storage
                .get_message(id)
                .await?
                .ok_or_else(|| AppError::not_found("message"))?;

            let chat = match chats.get(&message.chat_id) {
                Some(chat) => chat.clone(),
                None => {
                    if !self.directory.is_member(&message.chat_id, observer_id).await? {
                        return Err(AppError::permission("not a member of this chat"));
                    }
                    let chat = self
                        .directory
                        .chat(&message.chat_id)
                        .await?
                        .ok_or_else(|| AppError::not_found("chat"))?;
                    chats.insert(message.chat_id.clone(), chat.clone());
                    chat
                }
            };

            resolved.push((message, chat));
        }

        Ok(resolved)
    }

    async fn publish_status(&self, message: Message) {
        let chat_id = message.chat_id.clone();
        tracing::debug!("Message {} is now {:?}", message.id, message.status);
        self.sequencer
            .publish_ordered(&self.hub, &chat_id, Event::MessageUpdated(public_view(message)))
            .await;
    }

    /// `sent -> delivered`. No-op for the observer's own messages and for
    /// anything already delivered or read.
    pub async fn mark_delivered(&self, message_ids: &[String], observer_id: &str) -> Result<()> {
        for (message, chat) in self.resolve(message_ids, observer_id).await? {
            if message.sender_id == observer_id {
                continue;
            }

            if chat.chat_type != ChatType::Private {
                self.storage.record_delivery(&message.id, observer_id).await?;
            }

            if let Some(updated) = self.storage.advance_to_delivered(&message.id).await? {
                self.publish_status(updated).await;
            }
        }

        Ok(())
    }

    /// `sent | delivered -> read`, recording a receipt for the observer.
    pub async fn mark_read(&self, message_ids: &[String], observer_id: &str) -> Result<()> {
        let prefs = self.directory.resolve_privacy_prefs(observer_id).await?;

        for (message, chat) in self.resolve(message_ids, observer_id).await? {
            if message.sender_id == observer_id {
                continue;
            }

            match chat.chat_type {
                ChatType::Private => {
                    // Hidden read receipts still acknowledge delivery, and
                    // leave no receipt row behind.
                    let updated = if prefs.show_read_receipts {
                        self.storage.record_read(&message.id, observer_id).await?;
                        self.storage.advance_to_read(&message.id, false).await?
                    } else {
                        self.storage.record_delivery(&message.id, observer_id).await?;
                        self.storage.advance_to_delivered(&message.id).await?
                    };
                    if let Some(updated) = updated {
                        self.publish_status(updated).await;
                    }
                }
                ChatType::Group | ChatType::Channel => {
                    if !self.storage.record_read(&message.id, observer_id).await? {
                        continue;
                    }

                    if let Some(updated) = self.storage.advance_to_delivered(&message.id).await? {
                        self.publish_status(updated).await;
                    }

                    if let Some(updated) = self.storage.advance_to_read(&message.id, true).await? {
                        self.publish_status(updated).await;
                    }

                    let summary = self.summarize(&message).await?;

                    self.sequencer
                        .publish_ordered(&self.hub, &message.chat_id, Event::ReceiptsUpdated(summary))
                        .await;
                }
            }
        }

        Ok(())
    }

    /// Who has read `message_id`, out of how many recipients.
    pub async fn read_receipts(&self, message_id: &str, viewer_id: &str) -> Result<ReceiptSummary> {
        let message = self
            .storage
            .get_message(message_id)
            .await?
            .ok_or_else(|| AppError::not_found("message"))?;

        if !self.directory.is_member(&message.chat_id, viewer_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }

        self.summarize(&message).await
    }

    /// Readers out of the recipients the message had when it was sent.
    ///
    /// A group reader who hides read receipts still counts towards the
    /// summary status but is not named.
    async fn summarize(&self, message: &Message) -> Result<ReceiptSummary> {
        let mut readers = Vec::new();
        for receipt in self.storage.read_receipts(&message.id).await? {
            if self
                .directory
                .resolve_privacy_prefs(&receipt.user_id)
                .await?
                .show_read_receipts
            {
                readers.push(receipt);
            }
        }
        let total_recipients = self.storage.recipient_count(message).await?;

        Ok(ReceiptSummary {
            message_id: message.id.clone(),
            chat_id: message.chat_id.clone(),
            readers,
            total_recipients,
        })
    }
}
