//! Chat, membership and privacy handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::{AppError, Result},
    models::*,
    protocol::*,
    AppState,
};

use super::AuthUser;

pub async fn list_chats(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<ChatSummary>>> {
    Ok(Json(state.chats.list_chats(&auth.user_id).await?))
}

pub async fn open_private_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PrivateChatRequest>,
) -> Result<Json<Chat>> {
    let chat = state
        .chats
        .get_or_create_private_chat(&auth.user_id, &req.user_id)
        .await?;
    Ok(Json(chat))
}

pub async fn create_group(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CreateGroupRequest>,
) -> Result<Json<Chat>> {
    let chat = state
        .chats
        .create_group(&auth.user_id, &req.name, req.chat_type, &req.member_ids)
        .await?;
    Ok(Json(chat))
}

pub async fn get_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<ChatSummary>> {
    Ok(Json(state.chats.get_chat(&chat_id, &auth.user_id).await?))
}

pub async fn add_member(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<Value>> {
    state
        .chats
        .add_member(&chat_id, &auth.user_id, &req.user_id)
        .await?;
    Ok(Json(json!({ "added": req.user_id })))
}

pub async fn leave_chat(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<Value>> {
    state.chats.leave_chat(&chat_id, &auth.user_id).await?;
    Ok(Json(json!({ "left": chat_id })))
}

pub async fn set_flags(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    Json(req): Json<MembershipFlagsRequest>,
) -> Result<Json<ChatMembership>> {
    let membership = state
        .chats
        .set_flags(&chat_id, &auth.user_id, req.muted, req.pinned)
        .await?;
    Ok(Json(membership))
}

pub async fn pin_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    Json(req): Json<PinMessageRequest>,
) -> Result<Json<Chat>> {
    let chat = state
        .chats
        .pin_message(&chat_id, &auth.user_id, req.message_id.as_deref())
        .await?;
    Ok(Json(chat))
}

/// The client rendered the chat; reset its unread counter.
pub async fn mark_viewed(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    req: Option<Json<MarkViewedRequest>>,
) -> Result<Json<Value>> {
    let up_to_seq = req.and_then(|Json(r)| r.up_to_seq);
    let unread_count = state
        .aggregator
        .reset_unread(&chat_id, &auth.user_id, up_to_seq)
        .await?;
    Ok(Json(json!({ "chat_id": chat_id, "unread_count": unread_count })))
}

pub async fn get_privacy(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<PrivacyPrefs>> {
    Ok(Json(state.directory.resolve_privacy_prefs(&auth.user_id).await?))
}

pub async fn update_privacy(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(prefs): Json<PrivacyPrefs>,
) -> Result<Json<PrivacyPrefs>> {
    if !state.storage.update_privacy_prefs(&auth.user_id, &prefs).await? {
        return Err(AppError::not_found("user"));
    }
    tracing::info!("Privacy settings of {} updated", auth.user_id);
    Ok(Json(prefs))
}
