use serde_json::Value;

use crate::crypto;
use crate::error::{AppError, Result};
use crate::models::*;

use super::Storage;

#[derive(sqlx::FromRow)]
struct CallRow {
    id: String,
    chat_id: String,
    caller_id: String,
    callee_id: Option<String>,
    call_type: CallType,
    status: CallStatus,
    created_at: i64,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    duration_secs: Option<i64>,
    offer: Option<String>,
}

#[derive(sqlx::FromRow)]
struct ParticipantRow {
    call_id: String,
    user_id: String,
    is_muted: bool,
    is_video_enabled: bool,
    is_screen_sharing: bool,
    joined_at: Option<i64>,
    left_at: Option<i64>,
    answer: Option<String>,
    ice_candidates: String,
}

const CALL_COLUMNS: &str = "id, chat_id, caller_id, callee_id, call_type, status, created_at, \
     started_at, ended_at, duration_secs, offer";

const PARTICIPANT_COLUMNS: &str = "call_id, user_id, is_muted, is_video_enabled, is_screen_sharing, \
     joined_at, left_at, answer, ice_candidates";

fn parse_blob(raw: Option<&str>) -> Result<Option<Value>> {
    raw.map(serde_json::from_str)
        .transpose()
        .map_err(|e| AppError::Internal(e.into()))
}

impl TryFrom<ParticipantRow> for CallParticipant {
    type Error = AppError;

    fn try_from(row: ParticipantRow) -> Result<Self> {
        let ice_candidates: Vec<Value> =
            serde_json::from_str(&row.ice_candidates).map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            answer: parse_blob(row.answer.as_deref())?,
            call_id: row.call_id,
            user_id: row.user_id,
            is_muted: row.is_muted,
            is_video_enabled: row.is_video_enabled,
            is_screen_sharing: row.is_screen_sharing,
            joined_at: row.joined_at,
            left_at: row.left_at,
            ice_candidates,
        })
    }
}

impl Storage {
    // ========================================================================
    // Call Operations
    // ========================================================================

    /// Create a ringing call with the caller as first participant.
    ///
    /// A chat holds at most one live call; a second one fails with
    /// `InvalidState`.
    pub async fn insert_call(&self, chat_id: &str, caller_id: &str, call_type: CallType) -> Result<Call> {
        let call_id = crypto::new_id();
        let now = now_ms();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO calls (id, chat_id, caller_id, call_type, status, created_at)
             VALUES (?, ?, ?, ?, 'ringing', ?)",
        )
        .bind(&call_id)
        .bind(chat_id)
        .bind(caller_id)
        .bind(call_type)
        .bind(now)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(AppError::invalid_state("a call is already in progress in this chat"));
            }
            Err(e) => return Err(e.into()),
        }

        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, is_video_enabled, joined_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&call_id)
        .bind(caller_id)
        .bind(call_type == CallType::Video)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.get_call(&call_id)
            .await?
            .ok_or_else(|| AppError::not_found("call"))
    }

    pub async fn get_call(&self, call_id: &str) -> Result<Option<Call>> {
        let row = sqlx::query_as::<_, CallRow>(&format!(
            "SELECT {} FROM calls WHERE id = ?",
            CALL_COLUMNS
        ))
        .bind(call_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_call(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn live_call_in_chat(&self, chat_id: &str) -> Result<Option<Call>> {
        let row = sqlx::query_as::<_, CallRow>(&format!(
            "SELECT {} FROM calls WHERE chat_id = ? AND status IN ('ringing', 'connecting', 'active')",
            CALL_COLUMNS
        ))
        .bind(chat_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(self.hydrate_call(row).await?)),
            None => Ok(None),
        }
    }

    async fn hydrate_call(&self, row: CallRow) -> Result<Call> {
        let participants = sqlx::query_as::<_, ParticipantRow>(&format!(
            "SELECT {} FROM call_participants WHERE call_id = ? ORDER BY joined_at IS NULL, joined_at",
            PARTICIPANT_COLUMNS
        ))
        .bind(&row.id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(CallParticipant::try_from)
        .collect::<Result<Vec<_>>>()?;

        Ok(Call {
            offer: parse_blob(row.offer.as_deref())?,
            id: row.id,
            chat_id: row.chat_id,
            caller_id: row.caller_id,
            call_type: row.call_type,
            status: row.status,
            created_at: row.created_at,
            started_at: row.started_at,
            ended_at: row.ended_at,
            duration_secs: row.duration_secs,
            callee_id: row.callee_id,
            participants,
        })
    }

    /// Compare-and-set on `status`. Returns false if the call was no longer in `from`.
    ///
    /// Entering `active` stamps `started_at`; entering a terminal status
    /// stamps `ended_at`, and `ended` also records the duration.
    pub async fn transition_call(
        &self,
        call_id: &str,
        from: CallStatus,
        to: CallStatus,
        callee_id: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET
                status = ?1,
                callee_id = COALESCE(callee_id, ?2),
                started_at = CASE WHEN ?1 = 'active' THEN ?3 ELSE started_at END,
                ended_at = CASE WHEN ?1 IN ('ended', 'missed', 'declined') THEN ?3 ELSE ended_at END,
                duration_secs = CASE
                    WHEN ?1 = 'ended' AND started_at IS NOT NULL THEN (?3 - started_at) / 1000
                    ELSE duration_secs END
             WHERE id = ?4 AND status = ?5",
        )
        .bind(to)
        .bind(callee_id)
        .bind(now_ms())
        .bind(call_id)
        .bind(from)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn join_call(&self, call_id: &str, user_id: &str, video: bool) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, is_video_enabled, joined_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (call_id, user_id) DO UPDATE SET joined_at = ?4, left_at = NULL",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(video)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn leave_call(&self, call_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE call_participants SET left_at = ?
             WHERE call_id = ? AND joined_at IS NOT NULL AND left_at IS NULL",
        )
        .bind(now_ms())
        .bind(call_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ========================================================================
    // Signaling Payloads
    // ========================================================================

    pub async fn store_offer(&self, call_id: &str, offer: &Value) -> Result<()> {
        sqlx::query("UPDATE calls SET offer = ? WHERE id = ?")
            .bind(offer.to_string())
            .bind(call_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn store_answer(&self, call_id: &str, user_id: &str, answer: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, answer) VALUES (?1, ?2, ?3)
             ON CONFLICT (call_id, user_id) DO UPDATE SET answer = ?3",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(answer.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Append to the sender's candidate list without a read-modify-write race.
    pub async fn append_ice_candidate(&self, call_id: &str, user_id: &str, candidate: &Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO call_participants (call_id, user_id, ice_candidates)
             VALUES (?1, ?2, json_array(json(?3)))
             ON CONFLICT (call_id, user_id) DO UPDATE SET
                ice_candidates = json_insert(call_participants.ice_candidates, '$[#]', json(?3))",
        )
        .bind(call_id)
        .bind(user_id)
        .bind(candidate.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn update_participant(
        &self,
        call_id: &str,
        user_id: &str,
        update: &ParticipantUpdate,
    ) -> Result<Option<CallParticipant>> {
        let row = sqlx::query_as::<_, ParticipantRow>(&format!(
            "UPDATE call_participants SET
                is_muted = COALESCE(?, is_muted),
                is_video_enabled = COALESCE(?, is_video_enabled),
                is_screen_sharing = COALESCE(?, is_screen_sharing)
             WHERE call_id = ? AND user_id = ?
             RETURNING {}",
            PARTICIPANT_COLUMNS
        ))
        .bind(update.is_muted)
        .bind(update.is_video_enabled)
        .bind(update.is_screen_sharing)
        .bind(call_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .pop();

        row.map(CallParticipant::try_from).transpose()
    }

    /// Ids of calls still ringing that were created at or before `created_before`.
    pub async fn stale_ringing_calls(&self, created_before: i64) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM calls WHERE status = 'ringing' AND created_at <= ?",
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}
