//! Events relayed by the fan-out hub.
//!
//! Message events carry the full current entity, never a diff. Consumers
//! upsert by id and drop anything whose `version` is not newer than what
//! they hold.

use serde::{Deserialize, Serialize};

use crate::models::{
    Call, CallParticipant, CallSignal, Message, PresenceView, ReactionTally, ReceiptSummary,
    TypingIndicator,
};

/// Address of an event stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Topic {
    /// Everything that happens inside one chat.
    Chat(String),
    /// Events addressed to one user wherever they are connected.
    User(String),
}

impl Topic {
    pub fn chat(id: impl Into<String>) -> Self {
        Topic::Chat(id.into())
    }

    pub fn user(id: impl Into<String>) -> Self {
        Topic::User(id.into())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Topic::Chat(id) => write!(f, "chat:{}", id),
            Topic::User(id) => write!(f, "user:{}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub chat_id: String,
    pub message_id: String,
    pub sender_id: String,
    pub preview: String,
    pub muted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    MessageInserted(Message),
    MessageUpdated(Message),
    MessageDeleted(Message),
    ReceiptsUpdated(ReceiptSummary),
    ReactionsChanged {
        chat_id: String,
        message_id: String,
        reactions: Vec<ReactionTally>,
    },
    PresenceChanged(PresenceView),
    TypingStarted(TypingIndicator),
    TypingStopped {
        chat_id: String,
        user_id: String,
    },
    CallRinging(Call),
    CallUpdated(Call),
    CallSignal(CallSignal),
    ParticipantChanged(CallParticipant),
    Notification(Notification),
    UnreadChanged {
        chat_id: String,
        unread_count: i64,
    },
    ChatChanged {
        chat_id: String,
    },
    /// Published on the chat topic; ends that user's live subscriptions to it.
    MemberLeft {
        chat_id: String,
        user_id: String,
    },
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::MessageInserted(_) => "message_inserted",
            Event::MessageUpdated(_) => "message_updated",
            Event::MessageDeleted(_) => "message_deleted",
            Event::ReceiptsUpdated(_) => "receipts_updated",
            Event::ReactionsChanged { .. } => "reactions_changed",
            Event::PresenceChanged(_) => "presence_changed",
            Event::TypingStarted(_) => "typing_started",
            Event::TypingStopped { .. } => "typing_stopped",
            Event::CallRinging(_) => "call_ringing",
            Event::CallUpdated(_) => "call_updated",
            Event::CallSignal(_) => "call_signal",
            Event::ParticipantChanged(_) => "participant_changed",
            Event::Notification(_) => "notification",
            Event::UnreadChanged { .. } => "unread_changed",
            Event::ChatChanged { .. } => "chat_changed",
            Event::MemberLeft { .. } => "member_left",
        }
    }
}
