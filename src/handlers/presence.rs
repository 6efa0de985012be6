//! Presence and typing handlers

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

pub async fn set_presence(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PresenceRequest>,
) -> Result<Json<PresenceView>> {
    state.presence.set_presence(&auth.user_id, req.status).await;
    Ok(Json(state.presence.presence_of(&auth.user_id, &auth.user_id).await))
}

pub async fn heartbeat(State(state): State<AppState>, auth: AuthUser) -> Json<Value> {
    state.presence.heartbeat(&auth.user_id).await;
    Json(json!({ "ok": true }))
}

pub async fn get_presence(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<String>,
) -> Json<PresenceView> {
    Json(state.presence.presence_of(&user_id, &auth.user_id).await)
}

/// `activity: null` clears the caller's indicator.
pub async fn set_typing(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
    Json(req): Json<TypingRequest>,
) -> Json<Value> {
    match req.activity {
        Some(activity) => {
            state
                .presence
                .set_typing(&chat_id, &auth.user_id, activity)
                .await
        }
        None => state.presence.clear_typing(&chat_id, &auth.user_id),
    }
    Json(json!({ "ok": true }))
}

pub async fn typing_in(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<Vec<TypingIndicator>>> {
    if !state.directory.is_member(&chat_id, &auth.user_id).await? {
        return Err(AppError::permission("not a member of this chat"));
    }
    Ok(Json(state.presence.typing_in(&chat_id)))
}
