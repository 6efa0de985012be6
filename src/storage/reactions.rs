use crate::crypto;
use crate::error::Result;
use crate::models::now_ms;

use super::Storage;

impl Storage {
    // ========================================================================
    // Reaction Operations
    // ========================================================================

    /// Remove the triple if present, otherwise add it. Returns true when added.
    pub async fn toggle_reaction(&self, message_id: &str, user_id: &str, emoji: &str) -> Result<bool> {
        let removed = sqlx::query(
            "DELETE FROM message_reactions WHERE message_id = ? AND user_id = ? AND emoji = ?",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .execute(&self.pool)
        .await?;

        if removed.rows_affected() > 0 {
            return Ok(false);
        }

        sqlx::query(
            "INSERT OR IGNORE INTO message_reactions (id, message_id, user_id, emoji, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(crypto::new_id())
        .bind(message_id)
        .bind(user_id)
        .bind(emoji)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(true)
    }

    /// `(emoji, user_id)` pairs in insertion order.
    pub async fn reaction_rows(&self, message_id: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT emoji, user_id FROM message_reactions WHERE message_id = ? ORDER BY rowid ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
