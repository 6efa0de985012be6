//! HTTP request handlers for Courier Server

pub mod calls;
pub mod chats;
pub mod health;
pub mod messages;
pub mod presence;
pub mod websocket;

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use crate::{error::AppError, AppState};

/// Authenticated user context extracted from request
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AppError::Unauthorized)?;

        let session = state
            .storage
            .validate_session(token)
            .await
            .map_err(|e| {
                tracing::warn!("Session lookup failed: {}", e);
                AppError::Unauthorized
            })?
            .ok_or(AppError::Unauthorized)?;

        Ok(AuthUser {
            user_id: session.user_id,
        })
    }
}
