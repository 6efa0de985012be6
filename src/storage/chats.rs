use crate::crypto;
use crate::error::Result;
use crate::models::*;

use super::Storage;

const CHAT_COLUMNS: &str =
    "c.id, c.chat_type, c.name, c.avatar_url, c.description, c.created_by, c.created_at, c.pinned_message_id";

const MEMBER_COLUMNS: &str =
    "chat_id, user_id, role, unread_count, is_muted, is_pinned, joined_at, last_read_seq";

/// Order-independent key for the two members of a private chat.
fn pair_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}|{}", a, b)
    } else {
        format!("{}|{}", b, a)
    }
}

impl Storage {
    // ========================================================================
    // Chat Operations
    // ========================================================================

    /// Returns the private chat for the unordered pair, creating it on first use.
    pub async fn get_or_create_private_chat(&self, a: &str, b: &str) -> Result<Chat> {
        let key = pair_key(a, b);
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO chats (id, chat_type, created_by, created_at, pair_key)
             VALUES (?, 'private', ?, ?, ?)",
        )
        .bind(crypto::new_id())
        .bind(a)
        .bind(now)
        .bind(&key)
        .execute(&mut *tx)
        .await?;

        let chat = sqlx::query_as::<_, Chat>(&format!(
            "SELECT {} FROM chats c WHERE c.pair_key = ?",
            CHAT_COLUMNS
        ))
        .bind(&key)
        .fetch_one(&mut *tx)
        .await?;

        if inserted.rows_affected() == 1 {
            for user_id in [a, b] {
                sqlx::query(
                    "INSERT INTO chat_members (chat_id, user_id, role, joined_at) VALUES (?, ?, 'member', ?)",
                )
                .bind(&chat.id)
                .bind(user_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(chat)
    }

    pub async fn create_chat(
        &self,
        chat_type: ChatType,
        name: &str,
        created_by: &str,
        members: &[(String, MemberRole)],
    ) -> Result<Chat> {
        let now = now_ms();
        let chat = Chat {
            id: crypto::new_id(),
            chat_type,
            name: Some(name.to_string()),
            avatar_url: None,
            description: None,
            created_by: Some(created_by.to_string()),
            created_at: now,
            pinned_message_id: None,
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO chats (id, chat_type, name, created_by, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chat.id)
        .bind(chat.chat_type)
        .bind(&chat.name)
        .bind(&chat.created_by)
        .bind(chat.created_at)
        .execute(&mut *tx)
        .await?;

        for (user_id, role) in members {
            sqlx::query(
                "INSERT OR IGNORE INTO chat_members (chat_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&chat.id)
            .bind(user_id)
            .bind(role)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(chat)
    }

    pub async fn get_chat(&self, chat_id: &str) -> Result<Option<Chat>> {
        let chat = sqlx::query_as::<_, Chat>(&format!(
            "SELECT {} FROM chats c WHERE c.id = ?",
            CHAT_COLUMNS
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(chat)
    }

    pub async fn list_chats_for_user(&self, user_id: &str) -> Result<Vec<Chat>> {
        let chats = sqlx::query_as::<_, Chat>(&format!(
            "SELECT {} FROM chats c JOIN chat_members m ON m.chat_id = c.id
             WHERE m.user_id = ?
             ORDER BY m.is_pinned DESC, c.created_at DESC",
            CHAT_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(chats)
    }

    pub async fn chat_ids_for_user(&self, user_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT chat_id FROM chat_members WHERE user_id = ?")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn set_pinned_message(&self, chat_id: &str, message_id: Option<&str>) -> Result<bool> {
        let result = sqlx::query("UPDATE chats SET pinned_message_id = ? WHERE id = ?")
            .bind(message_id)
            .bind(chat_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Membership Operations
    // ========================================================================

    pub async fn get_membership(&self, chat_id: &str, user_id: &str) -> Result<Option<ChatMembership>> {
        let membership = sqlx::query_as::<_, ChatMembership>(&format!(
            "SELECT {} FROM chat_members WHERE chat_id = ? AND user_id = ?",
            MEMBER_COLUMNS
        ))
        .bind(chat_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(membership)
    }

    pub async fn list_members(&self, chat_id: &str) -> Result<Vec<ChatMembership>> {
        let members = sqlx::query_as::<_, ChatMembership>(&format!(
            "SELECT {} FROM chat_members WHERE chat_id = ? ORDER BY joined_at, user_id",
            MEMBER_COLUMNS
        ))
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }

    pub async fn member_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT user_id FROM chat_members WHERE chat_id = ? ORDER BY joined_at, user_id",
        )
        .bind(chat_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    pub async fn add_member(&self, chat_id: &str, user_id: &str, role: MemberRole) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO chat_members (chat_id, user_id, role, joined_at) VALUES (?, ?, ?, ?)",
        )
        .bind(chat_id)
        .bind(user_id)
        .bind(role)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn remove_member(&self, chat_id: &str, user_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chat_members WHERE chat_id = ? AND user_id = ?")
            .bind(chat_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_member_flags(
        &self,
        chat_id: &str,
        user_id: &str,
        muted: Option<bool>,
        pinned: Option<bool>,
    ) -> Result<Option<ChatMembership>> {
        let membership = sqlx::query_as::<_, ChatMembership>(&format!(
            "UPDATE chat_members SET
                is_muted = COALESCE(?, is_muted),
                is_pinned = COALESCE(?, is_pinned)
             WHERE chat_id = ? AND user_id = ?
             RETURNING {}",
            MEMBER_COLUMNS
        ))
        .bind(muted)
        .bind(pinned)
        .bind(chat_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(membership)
    }

    // ========================================================================
    // Unread Counters
    // ========================================================================

    /// Recompute the member's unread count against everything after `up_to_seq`.
    ///
    /// The count is derived from the log in the same statement that moves the
    /// read mark, so an append racing the reset is either counted or already
    /// covered by the mark. `last_read_seq` never moves backwards.
    pub async fn reset_unread(
        &self,
        chat_id: &str,
        user_id: &str,
        up_to_seq: Option<i64>,
    ) -> Result<Option<i64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            "UPDATE chat_members SET
                last_read_seq = MAX(last_read_seq, COALESCE(?1,
                    (SELECT MAX(seq) FROM messages WHERE chat_id = ?2), 0)),
                unread_count = (
                    SELECT COUNT(*) FROM messages
                    WHERE chat_id = ?2 AND sender_id != ?3
                      AND seq > MAX(chat_members.last_read_seq, COALESCE(?1,
                          (SELECT MAX(seq) FROM messages WHERE chat_id = ?2), 0))
                )
             WHERE chat_id = ?2 AND user_id = ?3
             RETURNING unread_count",
        )
        .bind(up_to_seq)
        .bind(chat_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        Ok(row.map(|(count,)| count))
    }
}
