//! Call signaling handlers

use axum::{
    extract::{Path, State},
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

pub async fn initiate_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<InitiateCallRequest>,
) -> Result<Json<Call>> {
    let call = state
        .calls
        .initiate(&req.chat_id, &auth.user_id, req.call_type)
        .await?;
    Ok(Json(call))
}

pub async fn answer_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Call>> {
    Ok(Json(state.calls.answer(&call_id, &auth.user_id).await?))
}

pub async fn decline_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Call>> {
    Ok(Json(state.calls.decline(&call_id, &auth.user_id).await?))
}

pub async fn end_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Call>> {
    Ok(Json(state.calls.end(&call_id, &auth.user_id).await?))
}

pub async fn relay_signal(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
    Json(signal): Json<SignalPayload>,
) -> Result<Json<Value>> {
    let kind = signal.kind;
    state
        .calls
        .relay_signal(&call_id, &auth.user_id, signal)
        .await?;
    Ok(Json(json!({ "relayed": kind })))
}

pub async fn update_participant(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
    Json(update): Json<ParticipantUpdate>,
) -> Result<Json<CallParticipant>> {
    let participant = state
        .calls
        .update_participant(&call_id, &auth.user_id, update)
        .await?;
    Ok(Json(participant))
}

pub async fn get_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(call_id): Path<String>,
) -> Result<Json<Call>> {
    Ok(Json(state.calls.get(&call_id, &auth.user_id).await?))
}

pub async fn live_call(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<Option<Call>>> {
    Ok(Json(state.calls.live_call(&chat_id, &auth.user_id).await?))
}
