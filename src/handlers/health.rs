//! Health check handler

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "online_users": state.sessions.online_user_count(),
        "sessions": state.sessions.session_count(),
        "topics": state.hub.topic_count(),
    }))
}
