use crate::error::Result;
use crate::models::*;

use super::messages::MESSAGE_COLUMNS;
use super::Storage;

impl Storage {
    // ========================================================================
    // Delivery Status (compare-and-set, forward only)
    // ========================================================================

    /// `sent -> delivered`. `None` if the message was not in `sent`.
    pub async fn advance_to_delivered(&self, message_id: &str) -> Result<Option<Message>> {
        let now = now_ms();
        let message = sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET
                status = 'delivered', delivered_at = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND status = 'sent'
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(message)
    }

    /// `sent | delivered -> read`.
    ///
    /// With `all_recipients` set the advance also requires a read receipt
    /// from every recipient, checked in the same statement. Recipients are
    /// the current members other than the sender who had joined by the time
    /// the message was created.
    pub async fn advance_to_read(&self, message_id: &str, all_recipients: bool) -> Result<Option<Message>> {
        let now = now_ms();
        let message = sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET
                status = 'read', read_at = ?, delivered_at = COALESCE(delivered_at, ?),
                version = version + 1, updated_at = ?
             WHERE id = ? AND status IN ('sent', 'delivered')
               AND (? = 0 OR NOT EXISTS (
                    SELECT 1 FROM chat_members cm
                    WHERE cm.chat_id = messages.chat_id
                      AND cm.user_id != messages.sender_id
                      AND cm.joined_at <= messages.created_at
                      AND NOT EXISTS (
                          SELECT 1 FROM message_reads r
                          WHERE r.message_id = messages.id AND r.user_id = cm.user_id
                      )
               ))
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(message_id)
        .bind(all_recipients)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(message)
    }

    // ========================================================================
    // Per-member Receipts
    // ========================================================================

    /// Returns true only for the first delivery by this user.
    pub async fn record_delivery(&self, message_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_deliveries (message_id, user_id, delivered_at) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Returns true only for the first read by this user.
    pub async fn record_read(&self, message_id: &str, user_id: &str) -> Result<bool> {
        let now = now_ms();
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        // A read implies delivery.
        sqlx::query(
            "INSERT OR IGNORE INTO message_deliveries (message_id, user_id, delivered_at) VALUES (?, ?, ?)",
        )
        .bind(message_id)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Read receipts from the message's recipients, oldest first.
    ///
    /// Readers who have since left the chat are not listed.
    pub async fn read_receipts(&self, message_id: &str) -> Result<Vec<ReadReceipt>> {
        let receipts = sqlx::query_as::<_, ReadReceipt>(
            "SELECT r.message_id, r.user_id, r.read_at
             FROM message_reads r
             JOIN messages m ON m.id = r.message_id
             JOIN chat_members cm ON cm.chat_id = m.chat_id AND cm.user_id = r.user_id
             WHERE r.message_id = ? AND cm.joined_at <= m.created_at
             ORDER BY r.read_at ASC, r.user_id ASC",
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(receipts)
    }

    /// Members other than the sender who had joined when `message` was created.
    pub async fn recipient_count(&self, message: &Message) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM chat_members
             WHERE chat_id = ? AND user_id != ? AND joined_at <= ?",
        )
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}
