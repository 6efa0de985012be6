//! Wire types: WebSocket frames and HTTP request bodies.

use serde::{Deserialize, Serialize};

use crate::events::{Event, Topic};
use crate::models::{
    ActivityType, AppendOutcome, CallType, ChatType, NewMessage, PresenceStatus, SignalPayload,
};

// ============================================================================
// WebSocket Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WsClientMessage {
    Authenticate {
        token: String,
    },
    Subscribe {
        chat_id: String,
    },
    Unsubscribe {
        chat_id: String,
    },
    /// `client_ref` is the sender's local id for the optimistic `sending` bubble.
    Send {
        chat_id: String,
        client_ref: String,
        message: NewMessage,
    },
    Typing {
        chat_id: String,
        activity: ActivityType,
    },
    StopTyping {
        chat_id: String,
    },
    Presence {
        status: PresenceStatus,
    },
    Heartbeat,
    MarkDelivered {
        message_ids: Vec<String>,
    },
    MarkRead {
        message_ids: Vec<String>,
    },
    CallSignal {
        call_id: String,
        signal: SignalPayload,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WsServerMessage {
    Authenticated {
        user_id: String,
        session_id: String,
    },
    Subscribed {
        chat_id: String,
    },
    Unsubscribed {
        chat_id: String,
    },
    Event {
        topic: Topic,
        event: Event,
    },
    /// The append is durable; the client swaps its `sending` bubble for `message`.
    Ack {
        client_ref: String,
        message: AppendOutcome,
    },
    /// Delivered to the submitting session only. The client shows `failed`.
    SendFailed {
        client_ref: String,
        code: String,
        message: String,
        retryable: bool,
    },
    /// Events were dropped for this topic; refetch instead of trusting the stream.
    Resync {
        topic: Topic,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}

// ============================================================================
// API Request Models
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PrivateChatRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateGroupRequest {
    pub name: String,
    #[serde(rename = "type")]
    pub chat_type: ChatType,
    #[serde(default)]
    pub member_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddMemberRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MembershipFlagsRequest {
    pub muted: Option<bool>,
    pub pinned: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PinMessageRequest {
    pub message_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    pub after_seq: Option<i64>,
    pub limit: Option<i64>,
    #[serde(default)]
    pub audit: bool,
}

#[derive(Debug, Deserialize)]
pub struct EditMessageRequest {
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    pub target_chat_id: String,
}

#[derive(Debug, Deserialize)]
pub struct MessageIdsRequest {
    pub message_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReactionRequest {
    pub emoji: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MarkViewedRequest {
    /// Last `seq` the client rendered; defaults to the newest message.
    pub up_to_seq: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct PresenceRequest {
    pub status: PresenceStatus,
}

#[derive(Debug, Deserialize)]
pub struct TypingRequest {
    /// `None` clears the indicator.
    pub activity: Option<ActivityType>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListScheduledQuery {
    pub chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EditScheduledRequest {
    pub content: Option<String>,
    pub scheduled_for: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct InitiateCallRequest {
    pub chat_id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
}
