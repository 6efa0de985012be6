//! Database storage layer for Courier Server
//!
//! The store is the single source of truth for durable state. Every
//! operation that must be race-free against concurrent writers is a single
//! conditional statement, or a transaction whose first statement writes so
//! SQLite takes the write lock up front.
//!
//! Writes with a `RETURNING` clause are always read with `fetch_all`. sqlx
//! stops stepping a statement after the first row it needs, which leaves the
//! write uncommitted on that connection and invisible to the rest of the pool.

mod calls;
mod chats;
mod messages;
mod reactions;
mod receipts;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};

use crate::crypto;
use crate::error::Result;
use crate::models::*;

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_path: &str) -> anyhow::Result<Self> {
        // Ensure directory exists
        if let Some(parent) = Path::new(database_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", database_path))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                user_id TEXT PRIMARY KEY,
                display_name TEXT,
                created_at INTEGER NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                show_online INTEGER NOT NULL DEFAULT 1,
                show_last_seen INTEGER NOT NULL DEFAULT 1,
                show_read_receipts INTEGER NOT NULL DEFAULT 1,
                allow_messages_from TEXT NOT NULL DEFAULT 'everyone',
                allow_calls_from TEXT NOT NULL DEFAULT 'everyone'
            );

            CREATE TABLE IF NOT EXISTS sessions (
                token_hash TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(user_id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS contacts (
                owner_id TEXT NOT NULL,
                contact_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (owner_id, contact_id)
            );

            CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                chat_type TEXT NOT NULL,
                name TEXT,
                avatar_url TEXT,
                description TEXT,
                created_by TEXT,
                created_at INTEGER NOT NULL,
                pinned_message_id TEXT,
                pair_key TEXT UNIQUE
            );

            CREATE TABLE IF NOT EXISTS chat_members (
                chat_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                role TEXT NOT NULL DEFAULT 'member',
                unread_count INTEGER NOT NULL DEFAULT 0 CHECK (unread_count >= 0),
                is_muted INTEGER NOT NULL DEFAULT 0,
                is_pinned INTEGER NOT NULL DEFAULT 0,
                joined_at INTEGER NOT NULL,
                last_read_seq INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (chat_id, user_id),
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                content TEXT,
                msg_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'sent'
                    CHECK (status IN ('sent', 'delivered', 'read')),
                is_edited INTEGER NOT NULL DEFAULT 0,
                edited_at INTEGER,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                deleted_at INTEGER,
                reply_to_id TEXT,
                forwarded_from_id TEXT,
                media_url TEXT,
                media_duration INTEGER,
                is_one_time INTEGER NOT NULL DEFAULT 0,
                delivered_at INTEGER,
                read_at INTEGER,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at INTEGER NOT NULL,
                UNIQUE (chat_id, seq),
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS scheduled_messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                content TEXT,
                msg_type TEXT NOT NULL,
                media_url TEXT,
                media_duration INTEGER,
                reply_to_id TEXT,
                is_one_time INTEGER NOT NULL DEFAULT 0,
                scheduled_for INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                message_id TEXT
            );

            CREATE TABLE IF NOT EXISTS message_deliveries (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                delivered_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS message_reads (
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                read_at INTEGER NOT NULL,
                PRIMARY KEY (message_id, user_id)
            );

            CREATE TABLE IF NOT EXISTS message_reactions (
                id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                emoji TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE (message_id, user_id, emoji)
            );

            CREATE TABLE IF NOT EXISTS calls (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                caller_id TEXT NOT NULL,
                callee_id TEXT,
                call_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'ringing',
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                ended_at INTEGER,
                duration_secs INTEGER,
                offer TEXT,
                FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS call_participants (
                call_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                is_muted INTEGER NOT NULL DEFAULT 0,
                is_video_enabled INTEGER NOT NULL DEFAULT 0,
                is_screen_sharing INTEGER NOT NULL DEFAULT 0,
                joined_at INTEGER,
                left_at INTEGER,
                answer TEXT,
                ice_candidates TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (call_id, user_id),
                FOREIGN KEY (call_id) REFERENCES calls(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_members_user ON chat_members(user_id);
            CREATE INDEX IF NOT EXISTS idx_messages_chat_seq ON messages(chat_id, seq);
            CREATE INDEX IF NOT EXISTS idx_scheduled_due ON scheduled_messages(state, scheduled_for);
            CREATE INDEX IF NOT EXISTS idx_reactions_message ON message_reactions(message_id);
            CREATE INDEX IF NOT EXISTS idx_calls_status ON calls(status, created_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_calls_one_live_per_chat
                ON calls(chat_id) WHERE status IN ('ringing', 'connecting', 'active');
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // User Operations
    // ========================================================================

    pub async fn create_user(&self, user_id: &str, display_name: Option<&str>) -> Result<()> {
        sqlx::query("INSERT INTO users (user_id, display_name, created_at) VALUES (?, ?, ?)")
            .bind(user_id)
            .bind(display_name)
            .bind(now_ms())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT user_id, display_name, created_at, is_active FROM users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    pub async fn get_privacy_prefs(&self, user_id: &str) -> Result<Option<PrivacyPrefs>> {
        let prefs = sqlx::query_as::<_, PrivacyPrefs>(
            "SELECT show_online, show_last_seen, show_read_receipts, allow_messages_from, allow_calls_from
             FROM users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(prefs)
    }

    pub async fn update_privacy_prefs(&self, user_id: &str, prefs: &PrivacyPrefs) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET
                show_online = ?, show_last_seen = ?, show_read_receipts = ?,
                allow_messages_from = ?, allow_calls_from = ?
             WHERE user_id = ?",
        )
        .bind(prefs.show_online)
        .bind(prefs.show_last_seen)
        .bind(prefs.show_read_receipts)
        .bind(prefs.allow_messages_from)
        .bind(prefs.allow_calls_from)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn add_contact(&self, owner_id: &str, contact_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO contacts (owner_id, contact_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(owner_id)
        .bind(contact_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn is_contact(&self, owner_id: &str, other_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM contacts WHERE owner_id = ? AND contact_id = ?")
                .bind(owner_id)
                .bind(other_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    // ========================================================================
    // Session Operations
    // ========================================================================

    pub async fn create_session(&self, user_id: &str, token: &str, ttl_hours: i64) -> Result<i64> {
        let now = now_ms();
        let expires_at = now + ttl_hours * 3_600_000;

        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(crypto::hash_token(token))
        .bind(user_id)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        Ok(expires_at)
    }

    pub async fn validate_session(&self, token: &str) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(
            "SELECT s.token_hash, s.user_id, s.created_at, s.expires_at
             FROM sessions s JOIN users u ON u.user_id = s.user_id
             WHERE s.token_hash = ? AND s.expires_at > ? AND u.is_active = 1",
        )
        .bind(crypto::hash_token(token))
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        Ok(session)
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
