//! Chat management on top of the SQL directory.

use std::sync::Arc;

use crate::directory::Directory;
use crate::error::{AppError, Result};
use crate::events::{Event, Topic};
use crate::fanout::Hub;
use crate::message_store::Sequencer;
use crate::models::*;
use crate::storage::Storage;

pub struct ChatService {
    storage: Arc<Storage>,
    directory: Arc<dyn Directory>,
    hub: Arc<Hub>,
    sequencer: Arc<Sequencer>,
}

impl ChatService {
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

    fn announce(&self, chat_id: &str, user_ids: &[String]) {
        let event = Event::ChatChanged {
            chat_id: chat_id.to_string(),
        };
        self.hub.publish(&Topic::chat(chat_id), event.clone());
        self.hub.publish_to_users(user_ids, &event);
    }

    /// Same chat for (a, b) and (b, a).
    pub async fn get_or_create_private_chat(&self, a: &str, b: &str) -> Result<Chat> {
        if a == b {
            return Err(AppError::validation("a private chat needs two different users"));
        }
        for user_id in [a, b] {
            if !self.directory.user_exists(user_id).await? {
                return Err(AppError::not_found("user"));
            }
        }

        let chat = self.storage.get_or_create_private_chat(a, b).await?;
        self.announce(&chat.id, &[a.to_string(), b.to_string()]);
        Ok(chat)
    }

    pub async fn create_group(
        &self,
        owner_id: &str,
        name: &str,
        chat_type: ChatType,
        member_ids: &[String],
    ) -> Result<Chat> {
        if chat_type == ChatType::Private {
            return Err(AppError::validation("use a private chat for two users"));
        }
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::validation("name is required"));
        }

        let mut members = vec![(owner_id.to_string(), MemberRole::Owner)];
        for user_id in member_ids.iter().filter(|id| id.as_str() != owner_id) {
            if !self.directory.user_exists(user_id).await? {
                return Err(AppError::not_found(format!("user {}", user_id)));
            }
            members.push((user_id.clone(), MemberRole::Member));
        }

        let chat = self
            .storage
            .create_chat(chat_type, name, owner_id, &members)
            .await?;
        tracing::info!("Chat {} ({:?}) created by {}", chat.id, chat_type, owner_id);

        let ids: Vec<String> = members.into_iter().map(|(id, _)| id).collect();
        self.announce(&chat.id, &ids);
        Ok(chat)
    }

    pub async fn add_member(&self, chat_id: &str, actor_id: &str, user_id: &str) -> Result<()> {
        let chat = self.load(chat_id).await?;
        if chat.chat_type == ChatType::Private {
            return Err(AppError::invalid_state("private chats have fixed members"));
        }

        let role = self
            .directory
            .get_role(chat_id, actor_id)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;
        if !role.can_manage() {
            return Err(AppError::permission("only owners and admins can add members"));
        }
        if !self.directory.user_exists(user_id).await? {
            return Err(AppError::not_found("user"));
        }

        if self.storage.add_member(chat_id, user_id, MemberRole::Member).await? {
            self.announce(chat_id, &[user_id.to_string()]);
        }
        Ok(())
    }

    pub async fn leave_chat(&self, chat_id: &str, user_id: &str) -> Result<()> {
        let chat = self.load(chat_id).await?;
        if chat.chat_type == ChatType::Private {
            return Err(AppError::invalid_state("cannot leave a private chat"));
        }

        {
            // Appends publish under the same lock, so nothing posted after
            // the removal is published ahead of MemberLeft.
            let _guard = self.sequencer.lock(chat_id).await;
            if !self.storage.remove_member(chat_id, user_id).await? {
                return Err(AppError::permission("not a member of this chat"));
            }
            self.hub.publish(
                &Topic::chat(chat_id),
                Event::MemberLeft {
                    chat_id: chat_id.to_string(),
                    user_id: user_id.to_string(),
                },
            );
        }

        tracing::info!("{} left chat {}", user_id, chat_id);
        self.announce(chat_id, &[user_id.to_string()]);
        Ok(())
    }

    /// Everything a reconnecting client needs to rebuild its chat list.
    pub async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatSummary>> {
        let chats = self.storage.list_chats_for_user(user_id).await?;
        let mut summaries = Vec::with_capacity(chats.len());

        for chat in chats {
            // Left between the two queries.
            let Some(membership) = self.storage.get_membership(&chat.id, user_id).await? else {
                continue;
            };
            summaries.push(self.summarize(chat, membership, user_id).await?);
        }

        Ok(summaries)
    }

    pub async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatSummary> {
        let chat = self.load(chat_id).await?;
        let membership = self
            .storage
            .get_membership(chat_id, user_id)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;

        self.summarize(chat, membership, user_id).await
    }

    async fn summarize(&self, chat: Chat, membership: ChatMembership, viewer_id: &str) -> Result<ChatSummary> {
        let member_ids = self.storage.member_ids(&chat.id).await?;
        let last_message = self
            .storage
            .last_message(&chat.id)
            .await?
            .map(|m| m.visible_to(viewer_id));

        Ok(ChatSummary {
            chat,
            membership,
            member_ids,
            last_message,
        })
    }

    pub async fn set_flags(
        &self,
        chat_id: &str,
        user_id: &str,
        muted: Option<bool>,
        pinned: Option<bool>,
    ) -> Result<ChatMembership> {
        let membership = self
            .storage
            .set_member_flags(chat_id, user_id, muted, pinned)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;

        self.hub.publish(
            &Topic::user(user_id),
            Event::ChatChanged {
                chat_id: chat_id.to_string(),
            },
        );
        Ok(membership)
    }

    /// Set or clear the pinned message. Any member may pin in a private
    /// chat; elsewhere only owners and admins.
    pub async fn pin_message(&self, chat_id: &str, actor_id: &str, message_id: Option<&str>) -> Result<Chat> {
        let chat = self.load(chat_id).await?;
        let role = self
            .directory
            .get_role(chat_id, actor_id)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;

        if chat.chat_type != ChatType::Private && !role.can_manage() {
            return Err(AppError::permission("only owners and admins can pin"));
        }

        if let Some(message_id) = message_id {
            let message = self
                .storage
                .get_message(message_id)
                .await?
                .filter(|m| m.chat_id == chat_id && !m.is_deleted)
                .ok_or_else(|| AppError::not_found("message"))?;
            tracing::debug!("Pinning {} in {}", message.id, chat_id);
        }

        self.storage.set_pinned_message(chat_id, message_id).await?;
        self.announce(chat_id, &[]);
        self.load(chat_id).await
    }

    async fn load(&self, chat_id: &str) -> Result<Chat> {
        self.directory
            .chat(chat_id)
            .await?
            .ok_or_else(|| AppError::not_found("chat"))
    }
}
