//! Token utilities for Courier Server
//!
//! Identity is issued elsewhere. The server only needs to map an opaque
//! bearer token to a user, so tokens are stored as SHA-256 digests.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ring::{
    digest,
    rand::{SecureRandom, SystemRandom},
};

const SESSION_TOKEN_LENGTH: usize = 32;

/// Generate a session token (base64url, 32 random bytes)
pub fn generate_session_token() -> anyhow::Result<String> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; SESSION_TOKEN_LENGTH];
    rng.fill(&mut bytes)
        .map_err(|_| anyhow::anyhow!("Failed to generate random bytes"))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Hash a token for storage (SHA-256, hex)
pub fn hash_token(token: &str) -> String {
    let hash = digest::digest(&digest::SHA256, token.as_bytes());
    hex::encode(hash.as_ref())
}

/// Constant-time string comparison for secrets of public length.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    if provided.len() != expected.len() {
        return false;
    }
    provided
        .as_bytes()
        .iter()
        .zip(expected.as_bytes().iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Entity ids are random UUIDs.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
