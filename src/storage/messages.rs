use sqlx::SqliteConnection;

use crate::crypto;
use crate::error::Result;
use crate::models::*;

use super::Storage;

pub(super) const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, seq, created_at, content, msg_type, status, \
     is_edited, edited_at, is_deleted, deleted_at, reply_to_id, forwarded_from_id, media_url, \
     media_duration, is_one_time, delivered_at, read_at, version, updated_at";

const SCHEDULED_COLUMNS: &str = "id, chat_id, sender_id, content, msg_type, media_url, media_duration, \
     reply_to_id, is_one_time, scheduled_for, created_at, state, message_id";

/// Append inside an open transaction: next `seq` for the chat, then one
/// unread increment for every member except the sender.
async fn insert_live(
    conn: &mut SqliteConnection,
    message_id: &str,
    chat_id: &str,
    sender_id: &str,
    new: &NewMessage,
) -> Result<Message> {
    let now = now_ms();

    let message = sqlx::query_as::<_, Message>(&format!(
        "INSERT INTO messages (
            id, chat_id, sender_id, seq, created_at, content, msg_type, status,
            reply_to_id, forwarded_from_id, media_url, media_duration, is_one_time,
            version, updated_at
         ) VALUES (
            ?, ?, ?, (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?),
            ?, ?, ?, 'sent', ?, ?, ?, ?, ?, 1, ?
         )
         RETURNING {}",
        MESSAGE_COLUMNS
    ))
    .bind(message_id)
    .bind(chat_id)
    .bind(sender_id)
    .bind(chat_id)
    .bind(now)
    .bind(&new.content)
    .bind(new.msg_type)
    .bind(&new.reply_to_id)
    .bind(&new.forwarded_from_id)
    .bind(&new.media_url)
    .bind(new.media_duration)
    .bind(new.is_one_time)
    .bind(now)
    .fetch_all(&mut *conn)
    .await?
    .pop()
    .ok_or(sqlx::Error::RowNotFound)?;

    sqlx::query(
        "UPDATE chat_members SET unread_count = unread_count + 1
         WHERE chat_id = ? AND user_id != ?",
    )
    .bind(chat_id)
    .bind(sender_id)
    .execute(&mut *conn)
    .await?;

    Ok(message)
}

impl Storage {
    // ========================================================================
    // Message Operations
    // ========================================================================

    pub async fn insert_message(&self, chat_id: &str, sender_id: &str, new: &NewMessage) -> Result<Message> {
        let mut tx = self.pool.begin().await?;
        let message = insert_live(&mut *tx, &crypto::new_id(), chat_id, sender_id, new).await?;
        tx.commit().await?;

        Ok(message)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE id = ?",
            MESSAGE_COLUMNS
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    pub async fn list_messages(&self, chat_id: &str, after_seq: i64, limit: i64) -> Result<Vec<Message>> {
        let messages = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE chat_id = ? AND seq > ? ORDER BY seq ASC LIMIT ?",
            MESSAGE_COLUMNS
        ))
        .bind(chat_id)
        .bind(after_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    pub async fn last_message(&self, chat_id: &str) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>(&format!(
            "SELECT {} FROM messages WHERE chat_id = ? ORDER BY seq DESC LIMIT 1",
            MESSAGE_COLUMNS
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    /// Replace the text of a live text message. Never touches `status`.
    pub async fn update_content(&self, message_id: &str, content: &str) -> Result<Option<Message>> {
        let now = now_ms();
        let message = sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET
                content = ?, is_edited = 1, edited_at = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND is_deleted = 0 AND msg_type = 'text'
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(content)
        .bind(now)
        .bind(now)
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(message)
    }

    /// Mark deleted. Returns `None` when it already was.
    pub async fn soft_delete(&self, message_id: &str) -> Result<Option<Message>> {
        let now = now_ms();
        let message = sqlx::query_as::<_, Message>(&format!(
            "UPDATE messages SET
                is_deleted = 1, deleted_at = ?, version = version + 1, updated_at = ?
             WHERE id = ? AND is_deleted = 0
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

    // ========================================================================
    // Scheduled Messages
    // ========================================================================

    pub async fn insert_scheduled(
        &self,
        chat_id: &str,
        sender_id: &str,
        new: &NewMessage,
        scheduled_for: i64,
    ) -> Result<ScheduledMessage> {
        let scheduled = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "INSERT INTO scheduled_messages (
                id, chat_id, sender_id, content, msg_type, media_url, media_duration,
                reply_to_id, is_one_time, scheduled_for, created_at, state
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending')
             RETURNING {}",
            SCHEDULED_COLUMNS
        ))
        .bind(crypto::new_id())
        .bind(chat_id)
        .bind(sender_id)
        .bind(&new.content)
        .bind(new.msg_type)
        .bind(&new.media_url)
        .bind(new.media_duration)
        .bind(&new.reply_to_id)
        .bind(new.is_one_time)
        .bind(scheduled_for)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?
        .pop()
        .ok_or(sqlx::Error::RowNotFound)?;

        Ok(scheduled)
    }

    pub async fn get_scheduled(&self, scheduled_id: &str) -> Result<Option<ScheduledMessage>> {
        let scheduled = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "SELECT {} FROM scheduled_messages WHERE id = ?",
            SCHEDULED_COLUMNS
        ))
        .bind(scheduled_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(scheduled)
    }

    pub async fn list_scheduled(&self, sender_id: &str, chat_id: Option<&str>) -> Result<Vec<ScheduledMessage>> {
        let scheduled = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "SELECT {} FROM scheduled_messages
             WHERE sender_id = ? AND state = 'pending' AND (? IS NULL OR chat_id = ?)
             ORDER BY scheduled_for ASC",
            SCHEDULED_COLUMNS
        ))
        .bind(sender_id)
        .bind(chat_id)
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(scheduled)
    }

    /// Only a still-pending entry can change.
    pub async fn update_scheduled(
        &self,
        scheduled_id: &str,
        content: Option<&str>,
        scheduled_for: Option<i64>,
    ) -> Result<Option<ScheduledMessage>> {
        let scheduled = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "UPDATE scheduled_messages SET
                content = COALESCE(?, content),
                scheduled_for = COALESCE(?, scheduled_for)
             WHERE id = ? AND state = 'pending'
             RETURNING {}",
            SCHEDULED_COLUMNS
        ))
        .bind(content)
        .bind(scheduled_for)
        .bind(scheduled_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(scheduled)
    }

    pub async fn cancel_scheduled(&self, scheduled_id: &str) -> Result<Option<ScheduledMessage>> {
        let scheduled = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "UPDATE scheduled_messages SET state = 'cancelled'
             WHERE id = ? AND state = 'pending'
             RETURNING {}",
            SCHEDULED_COLUMNS
        ))
        .bind(scheduled_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(scheduled)
    }

    pub async fn due_scheduled(&self, now: i64, limit: i64) -> Result<Vec<ScheduledMessage>> {
        let scheduled = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "SELECT {} FROM scheduled_messages
             WHERE state = 'pending' AND scheduled_for <= ?
             ORDER BY scheduled_for ASC LIMIT ?",
            SCHEDULED_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(scheduled)
    }

    /// Claim a pending entry and append its live message in one transaction.
    ///
    /// Returns `None` when someone else claimed, cancelled or rescheduled it
    /// first.
    pub async fn promote_scheduled(&self, scheduled: &ScheduledMessage, now: i64) -> Result<Option<Message>> {
        let message_id = crypto::new_id();
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            "UPDATE scheduled_messages SET state = 'sent', message_id = ?
             WHERE id = ? AND state = 'pending' AND scheduled_for <= ?",
        )
        .bind(&message_id)
        .bind(&scheduled.id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(None);
        }

        // Re-read under the claim so a last-moment edit is what goes live.
        let claimed = sqlx::query_as::<_, ScheduledMessage>(&format!(
            "SELECT {} FROM scheduled_messages WHERE id = ?",
            SCHEDULED_COLUMNS
        ))
        .bind(&scheduled.id)
        .fetch_one(&mut *tx)
        .await?;

        let message = insert_live(
            &mut *tx,
            &message_id,
            &claimed.chat_id,
            &claimed.sender_id,
            &claimed.to_new_message(),
        )
        .await?;

        tx.commit().await?;
        Ok(Some(message))
    }

    pub async fn fail_scheduled(&self, scheduled_id: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_messages SET state = 'failed' WHERE id = ? AND state = 'pending'")
            .bind(scheduled_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
