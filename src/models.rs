//! Data models for Courier Server
//!
//! Timestamps are unix milliseconds (UTC). Enum columns are stored as their
//! snake_case names.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: String,
    pub display_name: Option<String>,
    pub created_at: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub token_hash: String,
    pub user_id: String,
    pub created_at: i64,
    pub expires_at: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AllowFrom {
    Everyone,
    Contacts,
    Nobody,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, sqlx::FromRow)]
pub struct PrivacyPrefs {
    pub show_online: bool,
    pub show_last_seen: bool,
    pub show_read_receipts: bool,
    pub allow_messages_from: AllowFrom,
    pub allow_calls_from: AllowFrom,
}

impl Default for PrivacyPrefs {
    fn default() -> Self {
        Self {
            show_online: true,
            show_last_seen: true,
            show_read_receipts: true,
            allow_messages_from: AllowFrom::Everyone,
            allow_calls_from: AllowFrom::Everyone,
        }
    }
}

// ============================================================================
// Chat Models
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ChatType {
    Private,
    Group,
    Channel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MemberRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl MemberRole {
    pub fn can_manage(self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Admin)
    }

    /// Whether a member with this role may append to a chat of the given type.
    pub fn can_post(self, chat_type: ChatType) -> bool {
        match (chat_type, self) {
            (_, MemberRole::Viewer) => false,
            (ChatType::Channel, role) => role.can_manage(),
            (ChatType::Private | ChatType::Group, _) => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Chat {
    pub id: String,
    pub chat_type: ChatType,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub description: Option<String>,
    pub created_by: Option<String>,
    pub created_at: i64,
    pub pinned_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct ChatMembership {
    pub chat_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub unread_count: i64,
    pub is_muted: bool,
    pub is_pinned: bool,
    pub joined_at: i64,
    pub last_read_seq: i64,
}

/// Everything a client needs to rebuild its chat list after a reconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat: Chat,
    pub membership: ChatMembership,
    pub member_ids: Vec<String>,
    pub last_message: Option<Message>,
}

// ============================================================================
// Message Models
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    Photo,
    Video,
    Voice,
    VideoMessage,
    File,
    Music,
    Location,
}

impl MessageType {
    pub fn requires_media_url(self) -> bool {
        match self {
            MessageType::Text | MessageType::Location => false,
            MessageType::Photo
            | MessageType::Video
            | MessageType::Voice
            | MessageType::VideoMessage
            | MessageType::File
            | MessageType::Music => true,
        }
    }

    /// Only outgoing text can be edited.
    pub fn is_editable(self) -> bool {
        matches!(self, MessageType::Text)
    }

    pub fn preview_label(self) -> &'static str {
        match self {
            MessageType::Text => "Message",
            MessageType::Photo => "Photo",
            MessageType::Video => "Video",
            MessageType::Voice => "Voice message",
            MessageType::VideoMessage => "Video message",
            MessageType::File => "File",
            MessageType::Music => "Music",
            MessageType::Location => "Location",
        }
    }
}

/// Delivery status of a message.
///
/// `Sending` and `Failed` exist only on the submitting client: the store
/// never holds them. The authoritative sequence starts at `Sent` once the
/// append is durable and can only move forward from there.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Sending => 0,
            MessageStatus::Sent => 1,
            MessageStatus::Delivered => 2,
            MessageStatus::Read => 3,
            MessageStatus::Failed => 4,
        }
    }

    pub fn is_persisted(self) -> bool {
        matches!(
            self,
            MessageStatus::Sent | MessageStatus::Delivered | MessageStatus::Read
        )
    }

    /// Forward-only progression. `Failed` is terminal and reachable only from `Sending`.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Failed, _) => false,
            (current, MessageStatus::Failed) => current == MessageStatus::Sending,
            (_, MessageStatus::Sending) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Statuses from which a CAS update to `self` may start.
    pub fn predecessors(self) -> &'static [MessageStatus] {
        match self {
            MessageStatus::Delivered => &[MessageStatus::Sent],
            MessageStatus::Read => &[MessageStatus::Sent, MessageStatus::Delivered],
            MessageStatus::Sent => &[MessageStatus::Sending],
            MessageStatus::Failed => &[MessageStatus::Sending],
            MessageStatus::Sending => &[],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    /// Position in the chat's append order.
    pub seq: i64,
    pub created_at: i64,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub status: MessageStatus,
    pub is_edited: bool,
    pub edited_at: Option<i64>,
    pub is_deleted: bool,
    pub deleted_at: Option<i64>,
    pub reply_to_id: Option<String>,
    pub forwarded_from_id: Option<String>,
    pub media_url: Option<String>,
    pub media_duration: Option<i64>,
    pub is_one_time: bool,
    pub delivered_at: Option<i64>,
    pub read_at: Option<i64>,
    /// Bumped on every mutation so consumers can drop stale upserts.
    pub version: i64,
    pub updated_at: i64,
}

impl Message {
    /// Strip the payload, keeping identity and metadata.
    pub fn tombstoned(mut self) -> Self {
        self.content = None;
        self.media_url = None;
        self.media_duration = None;
        self
    }

    pub fn visible_to(self, viewer_id: &str) -> Self {
        if self.is_deleted && self.sender_id != viewer_id {
            self.tombstoned()
        } else {
            self
        }
    }

    /// True when `self` should replace `other` in a replace-by-id view.
    pub fn supersedes(&self, other: &Message) -> bool {
        self.id == other.id && self.version > other.version
    }

    pub fn preview(&self) -> String {
        if self.is_deleted {
            return "Deleted message".to_string();
        }
        match (self.msg_type, &self.content) {
            (MessageType::Text, Some(text)) => text.chars().take(100).collect(),
            (other, _) => other.preview_label().to_string(),
        }
    }
}

/// Back-reference rendered in reply and forward previews.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRef {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub is_deleted: bool,
}

impl MessageRef {
    /// References never expose a deleted payload, not even to the author.
    pub fn from_message(message: Message) -> Self {
        let message = if message.is_deleted {
            message.tombstoned()
        } else {
            message
        };
        Self {
            id: message.id,
            chat_id: message.chat_id,
            sender_id: message.sender_id,
            msg_type: message.msg_type,
            content: message.content,
            media_url: message.media_url,
            is_deleted: message.is_deleted,
        }
    }
}

/// A message as listed for one viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    #[serde(flatten)]
    pub message: Message,
    pub reply_to: Option<MessageRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePage {
    pub messages: Vec<MessageView>,
    /// Pass back as `after_seq` to continue; `None` once the log is exhausted.
    pub next_cursor: Option<i64>,
}

/// Input for a new message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMessage {
    pub content: Option<String>,
    #[serde(rename = "type", default)]
    pub msg_type: MessageType,
    pub media_url: Option<String>,
    pub media_duration: Option<i64>,
    pub reply_to_id: Option<String>,
    #[serde(skip)]
    pub forwarded_from_id: Option<String>,
    #[serde(default)]
    pub is_one_time: bool,
    pub scheduled_for: Option<i64>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self, max_chars: usize) -> Result<()> {
        if let Some(content) = &self.content {
            if content.chars().count() > max_chars {
                return Err(AppError::validation(format!(
                    "content exceeds {} characters",
                    max_chars
                )));
            }
        }

        let has_content = self
            .content
            .as_deref()
            .map(|c| !c.trim().is_empty())
            .unwrap_or(false);
        let has_media = self
            .media_url
            .as_deref()
            .map(|u| !u.is_empty())
            .unwrap_or(false);

        if self.msg_type.requires_media_url() {
            if !has_media {
                return Err(AppError::validation(format!(
                    "{:?} message requires a media url",
                    self.msg_type
                )));
            }
        } else if !has_content {
            return Err(AppError::validation("message content is empty"));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ScheduledState {
    Pending,
    Sent,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct ScheduledMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub media_url: Option<String>,
    pub media_duration: Option<i64>,
    pub reply_to_id: Option<String>,
    pub is_one_time: bool,
    pub scheduled_for: i64,
    pub created_at: i64,
    pub state: ScheduledState,
    pub message_id: Option<String>,
}

impl ScheduledMessage {
    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            content: self.content.clone(),
            msg_type: self.msg_type,
            media_url: self.media_url.clone(),
            media_duration: self.media_duration,
            reply_to_id: self.reply_to_id.clone(),
            forwarded_from_id: None,
            is_one_time: self.is_one_time,
            scheduled_for: None,
        }
    }
}

/// Result of an append: live immediately, or parked until its instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "item", rename_all = "snake_case")]
pub enum AppendOutcome {
    Live(Message),
    Scheduled(ScheduledMessage),
}

// ============================================================================
// Receipt Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, sqlx::FromRow)]
pub struct ReadReceipt {
    pub message_id: String,
    pub user_id: String,
    pub read_at: i64,
}

/// Group read state rendered as "N/total read".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReceiptSummary {
    pub message_id: String,
    pub chat_id: String,
    pub readers: Vec<ReadReceipt>,
    pub total_recipients: i64,
}

// ============================================================================
// Reaction Models
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReactionTally {
    pub emoji: String,
    pub count: u32,
    pub reacted: bool,
    pub users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateReactions {
    pub message_id: String,
    pub reactions: Vec<ReactionTally>,
    pub mine: Vec<String>,
}

impl AggregateReactions {
    /// Fold `(emoji, user_id)` rows, in creation order, into per-emoji tallies.
    pub fn from_rows(message_id: &str, rows: &[(String, String)], viewer_id: &str) -> Self {
        let mut reactions: Vec<ReactionTally> = Vec::new();
        for (emoji, user_id) in rows {
            let reacted = user_id == viewer_id;
            match reactions.iter_mut().find(|r| &r.emoji == emoji) {
                Some(tally) => {
                    tally.count += 1;
                    tally.reacted |= reacted;
                    tally.users.push(user_id.clone());
                }
                None => reactions.push(ReactionTally {
                    emoji: emoji.clone(),
                    count: 1,
                    reacted,
                    users: vec![user_id.clone()],
                }),
            }
        }

        let mine = reactions
            .iter()
            .filter(|r| r.reacted)
            .map(|r| r.emoji.clone())
            .collect();

        Self {
            message_id: message_id.to_string(),
            reactions,
            mine,
        }
    }
}

// ============================================================================
// Presence Models
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Recently,
    Offline,
    Invisible,
}

impl PresenceStatus {
    /// The status other users are allowed to observe.
    pub fn seen_by_others(self, prefs: &PrivacyPrefs) -> PresenceStatus {
        match self {
            PresenceStatus::Invisible => PresenceStatus::Offline,
            PresenceStatus::Online if !prefs.show_online => PresenceStatus::Recently,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PresenceView {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Typing,
    RecordingVoice,
    RecordingVideo,
    ChoosingPhoto,
    SendingMusic,
    AttachingFile,
    SendingLocation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypingIndicator {
    pub chat_id: String,
    pub user_id: String,
    pub activity: ActivityType,
    pub started_at: i64,
}

// ============================================================================
// Call Models
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CallType {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Connecting,
    Active,
    Ended,
    Missed,
    Declined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    Answer,
    Decline,
    End { by_caller: bool },
    Timeout,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CallStatus::Ended | CallStatus::Missed | CallStatus::Declined
        )
    }

    /// Next status for `action`. Returning `self` means the action is a no-op.
    pub fn apply(self, action: CallAction) -> Result<CallStatus> {
        use CallStatus::*;

        let next = match (self, action) {
            (Ringing, CallAction::Answer) => Active,
            (Ringing, CallAction::Decline) => Declined,
            // A caller hanging up before an answer is a miss for the callee.
            (Ringing, CallAction::End { by_caller: true }) => Missed,
            (Ringing, CallAction::End { by_caller: false }) => Declined,
            (Ringing, CallAction::Timeout) => Missed,
            (Connecting | Active, CallAction::End { .. }) => Ended,
            (Connecting | Active, CallAction::Timeout) => self,
            (status, CallAction::End { .. } | CallAction::Timeout) if status.is_terminal() => self,
            (status, action) => {
                return Err(AppError::invalid_state(format!(
                    "cannot {:?} a call that is {:?}",
                    action, status
                )))
            }
        };

        Ok(next)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalPayload {
    pub kind: SignalKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallSignal {
    pub call_id: String,
    pub sender_id: String,
    pub kind: SignalKind,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallParticipant {
    pub call_id: String,
    pub user_id: String,
    pub is_muted: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub joined_at: Option<i64>,
    pub left_at: Option<i64>,
    pub answer: Option<serde_json::Value>,
    pub ice_candidates: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParticipantUpdate {
    pub is_muted: Option<bool>,
    pub is_video_enabled: Option<bool>,
    pub is_screen_sharing: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Call {
    pub id: String,
    pub chat_id: String,
    pub caller_id: String,
    #[serde(rename = "type")]
    pub call_type: CallType,
    pub status: CallStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration_secs: Option<i64>,
    /// Set once the call is answered.
    pub callee_id: Option<String>,
    pub offer: Option<serde_json::Value>,
    pub participants: Vec<CallParticipant>,
}

impl Call {
    pub fn is_party(&self, user_id: &str) -> bool {
        self.caller_id == user_id || self.callee_id.as_deref() == Some(user_id)
    }
}
