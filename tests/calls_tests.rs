//! Call lifecycle and signal relay.

mod common;

use common::*;
use courier_server::error::AppError;
use courier_server::events::{Event, Topic};
use courier_server::models::*;
use serde_json::json;

#[tokio::test]
async fn test_declined_call_cannot_be_answered() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;
    let mut alice = app.state.hub.subscribe(Topic::user("alice"));
    let mut bob = app.state.hub.subscribe(Topic::user("bob"));

    let call = app
        .state
        .calls
        .initiate(&chat.id, "alice", CallType::Audio)
        .await
        .unwrap();
    assert_eq!(call.status, CallStatus::Ringing);

    // Only the callee rings.
    match next_event(&mut bob).await {
        Event::CallRinging(ringing) => assert_eq!(ringing.id, call.id),
        other => panic!("unexpected {:?}", other),
    }
    assert!(stays_quiet(&mut alice).await);

    let declined = app.state.calls.decline(&call.id, "bob").await.unwrap();
    assert_eq!(declined.status, CallStatus::Declined);
    assert!(declined.ended_at.is_some());

    for sub in [&mut alice, &mut bob] {
        match next_event(sub).await {
            Event::CallUpdated(updated) => assert_eq!(updated.status, CallStatus::Declined),
            other => panic!("unexpected {:?}", other),
        }
    }

    let err = app.state.calls.answer(&call.id, "bob").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn test_answer_then_end_twice() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let call = app
        .state
        .calls
        .initiate(&chat.id, "alice", CallType::Video)
        .await
        .unwrap();

    let err = app.state.calls.answer(&call.id, "alice").await.unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let active = app.state.calls.answer(&call.id, "bob").await.unwrap();
    assert_eq!(active.status, CallStatus::Active);
    assert_eq!(active.callee_id.as_deref(), Some("bob"));
    assert!(active.started_at.is_some());

    let ended = app.state.calls.end(&call.id, "alice").await.unwrap();
    assert_eq!(ended.status, CallStatus::Ended);
    assert!(ended.duration_secs.is_some());

    let again = app.state.calls.end(&call.id, "bob").await.unwrap();
    assert_eq!(again.status, CallStatus::Ended);
    assert_eq!(again.ended_at, ended.ended_at);
}

#[tokio::test]
async fn test_caller_cancel_is_missed() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let call = app
        .state
        .calls
        .initiate(&chat.id, "alice", CallType::Audio)
        .await
        .unwrap();
    let cancelled = app.state.calls.end(&call.id, "alice").await.unwrap();
    assert_eq!(cancelled.status, CallStatus::Missed);
}

#[tokio::test]
async fn test_one_live_call_per_chat() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let call = app
        .state
        .calls
        .initiate(&chat.id, "alice", CallType::Audio)
        .await
        .unwrap();
    let err = app
        .state
        .calls
        .initiate(&chat.id, "bob", CallType::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let live = app.state.calls.live_call(&chat.id, "bob").await.unwrap();
    assert_eq!(live.map(|c| c.id), Some(call.id.clone()));

    app.state.calls.end(&call.id, "alice").await.unwrap();
    app.state
        .calls
        .initiate(&chat.id, "bob", CallType::Audio)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_unanswered_call_times_out() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let call = app
        .state
        .calls
        .initiate(&chat.id, "alice", CallType::Audio)
        .await
        .unwrap();

    assert_eq!(app.state.calls.expire_unanswered(now_ms()).await.unwrap(), 0);

    let later = now_ms() + (app.state.config.calls.ring_timeout_secs as i64 + 1) * 1000;
    assert_eq!(app.state.calls.expire_unanswered(later).await.unwrap(), 1);

    let call = app.state.calls.get(&call.id, "bob").await.unwrap();
    assert_eq!(call.status, CallStatus::Missed);
}

#[tokio::test]
async fn test_signals_reach_only_the_other_party() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol"]).await;
    let group = app.group("alice", &["bob", "carol"]).await;

    let call = app
        .state
        .calls
        .initiate(&group.id, "alice", CallType::Audio)
        .await
        .unwrap();
    app.state.calls.answer(&call.id, "bob").await.unwrap();

    let mut alice = app.state.hub.subscribe(Topic::user("alice"));
    let mut bob = app.state.hub.subscribe(Topic::user("bob"));
    let mut carol = app.state.hub.subscribe(Topic::user("carol"));
    let mut chat = app.state.hub.subscribe(Topic::chat(&group.id));

    let offer = SignalPayload {
        kind: SignalKind::Offer,
        data: json!({"sdp": "v=0"}),
    };
    app.state
        .calls
        .relay_signal(&call.id, "alice", offer)
        .await
        .unwrap();

    match next_event(&mut bob).await {
        Event::CallSignal(signal) => {
            assert_eq!(signal.sender_id, "alice");
            assert_eq!(signal.kind, SignalKind::Offer);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(stays_quiet(&mut alice).await);
    assert!(stays_quiet(&mut carol).await);
    assert!(stays_quiet(&mut chat).await);

    let candidate = SignalPayload {
        kind: SignalKind::IceCandidate,
        data: json!({"candidate": "udp 1"}),
    };
    app.state
        .calls
        .relay_signal(&call.id, "bob", candidate)
        .await
        .unwrap();
    assert!(matches!(next_event(&mut alice).await, Event::CallSignal(_)));

    let stored = app.state.calls.get(&call.id, "alice").await.unwrap();
    assert_eq!(stored.offer, Some(json!({"sdp": "v=0"})));
    let bob_side = stored
        .participants
        .iter()
        .find(|p| p.user_id == "bob")
        .unwrap();
    assert_eq!(bob_side.ice_candidates.len(), 1);

    let bad = SignalPayload {
        kind: SignalKind::Answer,
        data: json!({}),
    };
    let err = app
        .state
        .calls
        .relay_signal(&call.id, "alice", bad)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    let intruder = SignalPayload {
        kind: SignalKind::IceCandidate,
        data: json!({}),
    };
    let err = app
        .state
        .calls
        .relay_signal(&call.id, "carol", intruder)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_participant_toggles() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let call = app
        .state
        .calls
        .initiate(&chat.id, "alice", CallType::Video)
        .await
        .unwrap();

    let err = app
        .state
        .calls
        .update_participant(&call.id, "alice", ParticipantUpdate::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    app.state.calls.answer(&call.id, "bob").await.unwrap();
    let mut alice = app.state.hub.subscribe(Topic::user("alice"));

    let participant = app
        .state
        .calls
        .update_participant(
            &call.id,
            "bob",
            ParticipantUpdate {
                is_muted: Some(true),
                ..ParticipantUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(participant.is_muted);
    assert!(participant.is_video_enabled);

    match next_event(&mut alice).await {
        Event::ParticipantChanged(p) => assert_eq!(p.user_id, "bob"),
        other => panic!("unexpected {:?}", other),
    }
}
