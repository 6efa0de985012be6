//! Message handlers

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::Result,
    models::*,
    protocol::*,
    AppState,
};

use super::AuthUser;

pub async fn append_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    Json(req): Json<NewMessage>,
) -> Result<Json<AppendOutcome>> {
    let outcome = state.messages.append(&chat_id, &auth.user_id, req).await?;
    // A sent message ends the sender's typing indicator.
    state.presence.clear_typing(&chat_id, &auth.user_id);
    Ok(Json(outcome))
}

pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<MessagePage>> {
    let page = state
        .messages
        .list_by_chat(&chat_id, &auth.user_id, query.after_seq, query.limit, query.audit)
        .await?;
    Ok(Json(page))
}

pub async fn get_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<Message>> {
    Ok(Json(state.messages.get(&message_id, &auth.user_id).await?))
}

pub async fn edit_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
    Json(req): Json<EditMessageRequest>,
) -> Result<Json<Message>> {
    let message = state
        .messages
        .edit(&message_id, &auth.user_id, &req.content)
        .await?;
    Ok(Json(message))
}

pub async fn delete_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<Value>> {
    state.messages.soft_delete(&message_id, &auth.user_id).await?;
    Ok(Json(json!({ "deleted": message_id })))
}

pub async fn forward_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(source_id): Path<String>,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<Message>> {
    let message = state
        .messages
        .forward(&req.target_chat_id, &auth.user_id, &source_id)
        .await?;
    Ok(Json(message))
}

/// Preview of a replied-to or forwarded message.
pub async fn get_reference(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<MessageRef>> {
    let reference = state
        .messages
        .resolve_reference(&message_id, &auth.user_id)
        .await?;
    Ok(Json(reference))
}

pub async fn toggle_reaction(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
    Json(req): Json<ReactionRequest>,
) -> Result<Json<AggregateReactions>> {
    let reactions = state
        .aggregator
        .toggle_reaction(&message_id, &auth.user_id, &req.emoji)
        .await?;
    Ok(Json(reactions))
}

pub async fn get_reactions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<AggregateReactions>> {
    let reactions = state
        .aggregator
        .reactions_for(&message_id, &auth.user_id)
        .await?;
    Ok(Json(reactions))
}

pub async fn get_receipts(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(message_id): Path<String>,
) -> Result<Json<ReceiptSummary>> {
    let summary = state
        .delivery
        .read_receipts(&message_id, &auth.user_id)
        .await?;
    Ok(Json(summary))
}

pub async fn mark_delivered(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<MessageIdsRequest>,
) -> Result<Json<Value>> {
    state
        .delivery
        .mark_delivered(&req.message_ids, &auth.user_id)
        .await?;
    Ok(Json(json!({ "delivered": req.message_ids.len() })))
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<MessageIdsRequest>,
) -> Result<Json<Value>> {
    state.mark_read(&auth.user_id, &req.message_ids).await?;
    Ok(Json(json!({ "read": req.message_ids.len() })))
}

pub async fn list_scheduled(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ListScheduledQuery>,
) -> Result<Json<Vec<ScheduledMessage>>> {
    let scheduled = state
        .messages
        .list_scheduled(&auth.user_id, query.chat_id.as_deref())
        .await?;
    Ok(Json(scheduled))
}

pub async fn edit_scheduled(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(scheduled_id): Path<String>,
    Json(req): Json<EditScheduledRequest>,
) -> Result<Json<ScheduledMessage>> {
    let scheduled = state
        .messages
        .edit_scheduled(
            &scheduled_id,
            &auth.user_id,
            req.content.as_deref(),
            req.scheduled_for,
        )
        .await?;
    Ok(Json(scheduled))
}

pub async fn cancel_scheduled(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(scheduled_id): Path<String>,
) -> Result<Json<ScheduledMessage>> {
    let scheduled = state
        .messages
        .cancel_scheduled(&scheduled_id, &auth.user_id)
        .await?;
    Ok(Json(scheduled))
}
