//! Call signaling coordinator.
//!
//! Status changes go through `CallStatus::apply` and are written with a
//! compare-and-set on the previous status, so concurrent answer/decline/end
//! calls settle on exactly one winner. Negotiation payloads are relayed only
//! to the other party's user topic, never to the chat.

use std::sync::Arc;
use std::time::Duration;

use crate::directory::{self, Directory};
use crate::error::{AppError, Result};
use crate::events::Event;
use crate::fanout::Hub;
use crate::models::*;
use crate::storage::Storage;

const CAS_ATTEMPTS: usize = 3;

pub struct CallCoordinator {
    storage: Arc<Storage>,
    directory: Arc<dyn Directory>,
    hub: Arc<Hub>,
    ring_timeout: Duration,
}

impl CallCoordinator {
    pub fn new(
        storage: Arc<Storage>,
        directory: Arc<dyn Directory>,
        hub: Arc<Hub>,
        ring_timeout: Duration,
    ) -> Self {
        Self {
            storage,
            directory,
            hub,
            ring_timeout,
        }
    }

    /// Start ringing every other member of the chat.
    pub async fn initiate(&self, chat_id: &str, caller_id: &str, call_type: CallType) -> Result<Call> {
        let chat = self
            .directory
            .chat(chat_id)
            .await?
            .ok_or_else(|| AppError::not_found("chat"))?;

        let role = self
            .directory
            .get_role(chat_id, caller_id)
            .await?
            .ok_or_else(|| AppError::permission("not a member of this chat"))?;
        if !role.can_post(chat.chat_type) {
            return Err(AppError::permission("your role cannot start calls here"));
        }

        let others: Vec<String> = self
            .directory
            .member_ids(chat_id)
            .await?
            .into_iter()
            .filter(|id| id != caller_id)
            .collect();

        if chat.chat_type == ChatType::Private {
            for callee in &others {
                let prefs = self.directory.resolve_privacy_prefs(callee).await?;
                if !directory::permits(self.directory.as_ref(), prefs.allow_calls_from, callee, caller_id).await? {
                    return Err(AppError::permission("this user does not accept calls from you"));
                }
            }
        }

        let call = self.storage.insert_call(chat_id, caller_id, call_type).await?;
        tracing::info!("Call {} ringing in chat {} ({:?})", call.id, chat_id, call_type);

        self.hub.publish_to_users(&others, &Event::CallRinging(call.clone()));
        Ok(call)
    }

    pub async fn answer(&self, call_id: &str, callee_id: &str) -> Result<Call> {
        let call = self.load(call_id).await?;
        self.ensure_callee(&call, callee_id).await?;

        self.drive(call_id, CallAction::Answer, Some(callee_id)).await
    }

    pub async fn decline(&self, call_id: &str, callee_id: &str) -> Result<Call> {
        let call = self.load(call_id).await?;
        self.ensure_callee(&call, callee_id).await?;

        self.drive(call_id, CallAction::Decline, Some(callee_id)).await
    }

    /// Hang up or cancel. Ending an already finished call returns it unchanged.
    pub async fn end(&self, call_id: &str, requester_id: &str) -> Result<Call> {
        let call = self.load(call_id).await?;

        let by_caller = call.caller_id == requester_id;
        if !by_caller {
            match &call.callee_id {
                Some(callee) if callee == requester_id => {}
                Some(_) => return Err(AppError::permission("not a party to this call")),
                None => self.ensure_callee(&call, requester_id).await?,
            }
        }

        self.drive(call_id, CallAction::End { by_caller }, None).await
    }

    /// Time out every call that rang longer than the ring timeout.
    pub async fn expire_unanswered(&self, now: i64) -> Result<usize> {
        let cutoff = now - self.ring_timeout.as_millis() as i64;
        let mut expired = 0;

        for call_id in self.storage.stale_ringing_calls(cutoff).await? {
            match self.drive(&call_id, CallAction::Timeout, None).await {
                Ok(call) if call.status == CallStatus::Missed => expired += 1,
                Ok(_) => {}
                Err(e) => tracing::warn!("Could not expire call {}: {}", call_id, e),
            }
        }

        Ok(expired)
    }

    /// Load, compute the next status, compare-and-set; retry if someone
    /// else moved the call in between.
    async fn drive(&self, call_id: &str, action: CallAction, callee_id: Option<&str>) -> Result<Call> {
        for _ in 0..CAS_ATTEMPTS {
            let call = self.load(call_id).await?;
            let next = call.status.apply(action)?;
            if next == call.status {
                return Ok(call);
            }

            if !self
                .storage
                .transition_call(call_id, call.status, next, callee_id)
                .await?
            {
                continue;
            }

            if let (CallStatus::Active, Some(callee)) = (next, callee_id) {
                self.storage
                    .join_call(call_id, callee, call.call_type == CallType::Video)
                    .await?;
            }
            if next.is_terminal() {
                self.storage.leave_call(call_id).await?;
            }

            tracing::info!("Call {}: {:?} -> {:?}", call_id, call.status, next);
            let call = self.load(call_id).await?;
            self.publish_update(&call).await?;
            return Ok(call);
        }

        Err(AppError::invalid_state("call changed concurrently, refetch"))
    }

    /// Every member hears about status changes so that other devices and
    /// other group members stop ringing.
    async fn publish_update(&self, call: &Call) -> Result<()> {
        let members = self.directory.member_ids(&call.chat_id).await?;
        self.hub.publish_to_users(&members, &Event::CallUpdated(call.clone()));
        Ok(())
    }

    /// A callee is any other member of the chat while nobody has answered,
    /// and the answering member after that.
    async fn ensure_callee(&self, call: &Call, user_id: &str) -> Result<()> {
        if call.caller_id == user_id {
            return Err(AppError::permission("the caller cannot answer or decline"));
        }
        if let Some(callee) = &call.callee_id {
            if callee != user_id {
                return Err(AppError::permission("not a party to this call"));
            }
        }
        if !self.directory.is_member(&call.chat_id, user_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }
        Ok(())
    }

    // ========================================================================
    // Signaling
    // ========================================================================

    /// Store and forward an offer, answer or ICE candidate to the other side.
    pub async fn relay_signal(&self, call_id: &str, sender_id: &str, payload: SignalPayload) -> Result<()> {
        let call = self.load(call_id).await?;

        if call.status.is_terminal() {
            return Err(AppError::invalid_state(format!("call is {:?}", call.status)));
        }

        let recipients: Vec<String> = if call.caller_id == sender_id {
            match &call.callee_id {
                Some(callee) => vec![callee.clone()],
                None => self
                    .directory
                    .member_ids(&call.chat_id)
                    .await?
                    .into_iter()
                    .filter(|id| id != sender_id)
                    .collect(),
            }
        } else {
            self.ensure_callee(&call, sender_id).await?;
            vec![call.caller_id.clone()]
        };

        match payload.kind {
            SignalKind::Offer => {
                if call.caller_id != sender_id {
                    return Err(AppError::validation("only the caller sends the offer"));
                }
                self.storage.store_offer(call_id, &payload.data).await?;
            }
            SignalKind::Answer => {
                if call.caller_id == sender_id {
                    return Err(AppError::validation("the caller cannot send an answer"));
                }
                self.storage.store_answer(call_id, sender_id, &payload.data).await?;
            }
            SignalKind::IceCandidate => {
                self.storage
                    .append_ice_candidate(call_id, sender_id, &payload.data)
                    .await?;
            }
        }

        tracing::debug!("Relaying {:?} for call {} to {} peers", payload.kind, call_id, recipients.len());
        let signal = Event::CallSignal(CallSignal {
            call_id: call_id.to_string(),
            sender_id: sender_id.to_string(),
            kind: payload.kind,
            data: payload.data,
        });
        self.hub.publish_to_users(&recipients, &signal);

        Ok(())
    }

    /// Toggle your own mute/video/screen-share while the call is active.
    pub async fn update_participant(
        &self,
        call_id: &str,
        user_id: &str,
        update: ParticipantUpdate,
    ) -> Result<CallParticipant> {
        let call = self.load(call_id).await?;

        if call.status != CallStatus::Active {
            return Err(AppError::invalid_state(format!("call is {:?}", call.status)));
        }
        if !call.is_party(user_id) {
            return Err(AppError::permission("not a party to this call"));
        }

        let participant = self
            .storage
            .update_participant(call_id, user_id, &update)
            .await?
            .ok_or_else(|| AppError::permission("not a participant of this call"))?;

        let others: Vec<String> = call
            .participants
            .iter()
            .map(|p| p.user_id.clone())
            .filter(|id| id != user_id)
            .collect();
        self.hub
            .publish_to_users(&others, &Event::ParticipantChanged(participant.clone()));

        Ok(participant)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub async fn get(&self, call_id: &str, viewer_id: &str) -> Result<Call> {
        let call = self.load(call_id).await?;
        if !self.directory.is_member(&call.chat_id, viewer_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }
        Ok(call)
    }

    pub async fn live_call(&self, chat_id: &str, viewer_id: &str) -> Result<Option<Call>> {
        if !self.directory.is_member(chat_id, viewer_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }
        self.storage.live_call_in_chat(chat_id).await
    }

    async fn load(&self, call_id: &str) -> Result<Call> {
        self.storage
            .get_call(call_id)
            .await?
            .ok_or_else(|| AppError::not_found("call"))
    }
}
