//! Message store, unread counters and chat management.

mod common;

use std::collections::HashSet;

use common::*;
use courier_server::error::AppError;
use courier_server::events::{Event, Topic};
use courier_server::models::*;

#[tokio::test]
async fn test_private_chat_is_the_same_both_ways() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;

    let ab = app.private_chat("alice", "bob").await;
    let ba = app.private_chat("bob", "alice").await;
    assert_eq!(ab.id, ba.id);
    assert_eq!(ab.chat_type, ChatType::Private);

    let members = app.state.storage.member_ids(&ab.id).await.unwrap();
    assert_eq!(members.len(), 2);

    let err = app
        .state
        .chats
        .get_or_create_private_chat("alice", "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_seq_is_gapless_under_concurrent_appends() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let state = app.state.clone();
        let chat_id = chat.id.clone();
        let sender = if i % 2 == 0 { "alice" } else { "bob" };
        handles.push(tokio::spawn(async move {
            state
                .messages
                .append(&chat_id, sender, NewMessage::text(format!("m{}", i)))
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let page = app
        .state
        .messages
        .list_by_chat(&chat.id, "alice", None, Some(100), false)
        .await
        .unwrap();
    let seqs: Vec<i64> = page.messages.iter().map(|m| m.message.seq).collect();
    assert_eq!(seqs, (1..=20).collect::<Vec<_>>());
    assert!(page.next_cursor.is_none());
}

#[tokio::test]
async fn test_pagination_cursor() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;
    for i in 0..5 {
        app.send(&chat.id, "alice", &format!("m{}", i)).await;
    }

    let first = app
        .state
        .messages
        .list_by_chat(&chat.id, "bob", None, Some(2), false)
        .await
        .unwrap();
    assert_eq!(first.messages.len(), 2);
    let cursor = first.next_cursor.unwrap();

    let rest = app
        .state
        .messages
        .list_by_chat(&chat.id, "bob", Some(cursor), Some(10), false)
        .await
        .unwrap();
    assert_eq!(rest.messages.len(), 3);
    assert_eq!(rest.messages[0].message.content.as_deref(), Some("m2"));
    assert!(rest.next_cursor.is_none());
}

#[tokio::test]
async fn test_unread_counts_follow_the_log() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    for i in 0..3 {
        app.send(&chat.id, "alice", &format!("m{}", i)).await;
    }
    assert_eq!(app.unread(&chat.id, "bob").await, 3);
    assert_eq!(app.unread(&chat.id, "alice").await, 0);

    let left = app
        .state
        .aggregator
        .reset_unread(&chat.id, "bob", None)
        .await
        .unwrap();
    assert_eq!(left, 0);

    app.send(&chat.id, "alice", "m3").await;
    let last = app.send(&chat.id, "alice", "m4").await;
    assert_eq!(app.unread(&chat.id, "bob").await, 2);

    // Viewed up to the one before the newest.
    let left = app
        .state
        .aggregator
        .reset_unread(&chat.id, "bob", Some(last.seq - 1))
        .await
        .unwrap();
    assert_eq!(left, 1);

    // The read mark never moves backwards.
    let left = app
        .state
        .aggregator
        .reset_unread(&chat.id, "bob", Some(1))
        .await
        .unwrap();
    assert_eq!(left, 1);

    let err = app
        .state
        .aggregator
        .reset_unread(&chat.id, "mallory", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_deleted_message_is_a_tombstone() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let original = app.send(&chat.id, "alice", "secret").await;
    let reply = match app
        .state
        .messages
        .append(
            &chat.id,
            "bob",
            NewMessage {
                reply_to_id: Some(original.id.clone()),
                ..NewMessage::text("what?")
            },
        )
        .await
        .unwrap()
    {
        AppendOutcome::Live(m) => m,
        other => panic!("unexpected {:?}", other),
    };

    app.state.messages.soft_delete(&original.id, "alice").await.unwrap();
    // Deleting twice is fine.
    app.state.messages.soft_delete(&original.id, "alice").await.unwrap();

    let page = app
        .state
        .messages
        .list_by_chat(&chat.id, "bob", None, None, false)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 2);
    let tombstone = &page.messages[0].message;
    assert!(tombstone.is_deleted);
    assert!(tombstone.content.is_none());

    let reply_view = &page.messages[1];
    assert_eq!(reply_view.message.id, reply.id);
    let reference = reply_view.reply_to.as_ref().unwrap();
    assert!(reference.is_deleted);
    assert!(reference.content.is_none());

    let reference = app
        .state
        .messages
        .resolve_reference(&original.id, "bob")
        .await
        .unwrap();
    assert!(reference.is_deleted);

    let err = app
        .state
        .messages
        .edit(&original.id, "alice", "changed")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn test_edit_keeps_status_and_bumps_version() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let message = app.send(&chat.id, "alice", "helo").await;
    app.state
        .delivery
        .mark_delivered(&[message.id.clone()], "bob")
        .await
        .unwrap();

    let edited = app.state.messages.edit(&message.id, "alice", "hello").await.unwrap();
    assert!(edited.is_edited);
    assert_eq!(edited.content.as_deref(), Some("hello"));
    assert_eq!(edited.status, MessageStatus::Delivered);
    assert!(edited.version > message.version);

    let err = app.state.messages.edit(&message.id, "bob", "mine now").await.unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_forwarded_copy_is_independent() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol"]).await;
    let source_chat = app.private_chat("alice", "bob").await;
    let target_chat = app.group("alice", &["carol"]).await;

    let original = app.send(&source_chat.id, "alice", "news").await;
    let copy = app
        .state
        .messages
        .forward(&target_chat.id, "alice", &original.id)
        .await
        .unwrap();
    assert_eq!(copy.forwarded_from_id.as_deref(), Some(original.id.as_str()));
    assert_eq!(copy.chat_id, target_chat.id);

    app.state.messages.edit(&original.id, "alice", "old news").await.unwrap();
    app.state.messages.soft_delete(&original.id, "alice").await.unwrap();

    let copy = app.message(&copy.id).await;
    assert_eq!(copy.content.as_deref(), Some("news"));
    assert!(!copy.is_deleted);

    // Carol cannot see the source chat, so she cannot forward from it.
    let err = app
        .state
        .messages
        .forward(&target_chat.id, "carol", &original.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_posting_permissions() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol", "mallory"]).await;

    let group = app.group("alice", &["bob"]).await;
    app.state
        .storage
        .add_member(&group.id, "carol", MemberRole::Viewer)
        .await
        .unwrap();

    app.send(&group.id, "bob", "member can post").await;

    let err = app
        .state
        .messages
        .append(&group.id, "carol", NewMessage::text("viewer"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let err = app
        .state
        .messages
        .append(&group.id, "mallory", NewMessage::text("outsider"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let channel = app
        .state
        .chats
        .create_group("alice", "news", ChatType::Channel, &["bob".to_string()])
        .await
        .unwrap();
    app.send(&channel.id, "alice", "announcement").await;
    let err = app
        .state
        .messages
        .append(&channel.id, "bob", NewMessage::text("reply"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_media_message_requires_url() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let err = app
        .state
        .messages
        .append(
            &chat.id,
            "alice",
            NewMessage {
                msg_type: MessageType::Photo,
                ..NewMessage::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_contacts_only_privacy_blocks_strangers() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let prefs = PrivacyPrefs {
        allow_messages_from: AllowFrom::Contacts,
        ..PrivacyPrefs::default()
    };
    app.state.storage.update_privacy_prefs("bob", &prefs).await.unwrap();

    let err = app
        .state
        .messages
        .append(&chat.id, "alice", NewMessage::text("hi"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    app.state.storage.add_contact("bob", "alice").await.unwrap();
    app.send(&chat.id, "alice", "hi").await;
}

#[tokio::test]
async fn test_scheduled_message_goes_live_once() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let at = now_ms() + 60_000;
    let outcome = app
        .state
        .messages
        .append(
            &chat.id,
            "alice",
            NewMessage {
                scheduled_for: Some(at),
                ..NewMessage::text("later")
            },
        )
        .await
        .unwrap();
    let scheduled = match outcome {
        AppendOutcome::Scheduled(s) => s,
        other => panic!("expected a scheduled message, got {:?}", other),
    };
    assert_eq!(scheduled.state, ScheduledState::Pending);
    assert_eq!(app.unread(&chat.id, "bob").await, 0);

    assert_eq!(app.state.messages.promote_due(now_ms()).await.unwrap(), 0);

    // Two sweeps racing over the same due entry.
    let (a, b) = tokio::join!(
        app.state.messages.promote_due(at + 1),
        app.state.messages.promote_due(at + 1)
    );
    assert_eq!(a.unwrap() + b.unwrap(), 1);

    let page = app
        .state
        .messages
        .list_by_chat(&chat.id, "bob", None, None, false)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 1);
    assert_eq!(page.messages[0].message.content.as_deref(), Some("later"));
    assert_eq!(app.unread(&chat.id, "bob").await, 1);

    let entry = app.state.storage.get_scheduled(&scheduled.id).await.unwrap().unwrap();
    assert_eq!(entry.state, ScheduledState::Sent);
    assert_eq!(entry.message_id.as_deref(), Some(page.messages[0].message.id.as_str()));
    assert!(app.state.messages.list_scheduled("alice", None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_scheduled_message_never_posts() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let at = now_ms() + 60_000;
    let scheduled = match app
        .state
        .messages
        .append(
            &chat.id,
            "alice",
            NewMessage {
                scheduled_for: Some(at),
                ..NewMessage::text("never")
            },
        )
        .await
        .unwrap()
    {
        AppendOutcome::Scheduled(s) => s,
        other => panic!("unexpected {:?}", other),
    };

    let err = app
        .state
        .messages
        .cancel_scheduled(&scheduled.id, "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    let edited = app
        .state
        .messages
        .edit_scheduled(&scheduled.id, "alice", Some("still never"), None)
        .await
        .unwrap();
    assert_eq!(edited.content.as_deref(), Some("still never"));

    let cancelled = app
        .state
        .messages
        .cancel_scheduled(&scheduled.id, "alice")
        .await
        .unwrap();
    assert_eq!(cancelled.state, ScheduledState::Cancelled);

    let err = app
        .state
        .messages
        .cancel_scheduled(&scheduled.id, "alice")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    assert_eq!(app.state.messages.promote_due(at + 1).await.unwrap(), 0);
    let page = app
        .state
        .messages
        .list_by_chat(&chat.id, "alice", None, None, false)
        .await
        .unwrap();
    assert!(page.messages.is_empty());
}

#[tokio::test]
async fn test_reaction_toggles() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;
    let message = app.send(&chat.id, "alice", "vote").await;

    let first = app
        .state
        .aggregator
        .toggle_reaction(&message.id, "bob", "👍")
        .await
        .unwrap();
    assert_eq!(first.reactions.len(), 1);
    assert_eq!(first.reactions[0].count, 1);
    assert_eq!(first.mine, vec!["👍".to_string()]);

    let seen_by_alice = app
        .state
        .aggregator
        .reactions_for(&message.id, "alice")
        .await
        .unwrap();
    assert!(!seen_by_alice.reactions[0].reacted);

    let second = app
        .state
        .aggregator
        .toggle_reaction(&message.id, "bob", "👍")
        .await
        .unwrap();
    assert!(second.reactions.is_empty());
    assert!(second.mine.is_empty());

    let err = app
        .state
        .aggregator
        .toggle_reaction(&message.id, "bob", "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_group_membership_changes() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol"]).await;
    let group = app.group("alice", &["bob"]).await;

    let err = app
        .state
        .chats
        .add_member(&group.id, "bob", "carol")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));

    app.state.chats.add_member(&group.id, "alice", "carol").await.unwrap();
    let chats = app.state.chats.list_chats("carol").await.unwrap();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].member_ids.len(), 3);

    app.state.chats.leave_chat(&group.id, "carol").await.unwrap();
    assert!(app.state.chats.list_chats("carol").await.unwrap().is_empty());

    let private = app.private_chat("alice", "bob").await;
    let err = app.state.chats.leave_chat(&private.id, "bob").await.unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let ids: HashSet<String> = app
        .state
        .chats
        .list_chats("alice")
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.chat.id)
        .collect();
    assert!(ids.contains(&group.id) && ids.contains(&private.id));
}

#[tokio::test]
async fn test_only_live_text_messages_can_be_edited() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let photo = match app
        .state
        .messages
        .append(
            &chat.id,
            "alice",
            NewMessage {
                msg_type: MessageType::Photo,
                media_url: Some("https://cdn.example/p.jpg".to_string()),
                ..NewMessage::default()
            },
        )
        .await
        .unwrap()
    {
        AppendOutcome::Live(m) => m,
        other => panic!("unexpected {:?}", other),
    };
    let err = app
        .state
        .messages
        .edit(&photo.id, "alice", "a caption")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
    assert!(!app.message(&photo.id).await.is_edited);

    let text = app.send(&chat.id, "alice", "oops").await;
    app.state.messages.soft_delete(&text.id, "alice").await.unwrap();
    let err = app
        .state
        .messages
        .edit(&text.id, "alice", "fixed")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));
}

#[tokio::test]
async fn test_leaving_ends_live_chat_subscriptions() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol"]).await;
    let group = app.group("alice", &["bob", "carol"]).await;

    let mut carol = app.state.hub.subscribe_member(Topic::chat(&group.id), "carol");
    let mut bob = app.state.hub.subscribe_member(Topic::chat(&group.id), "bob");

    app.state.chats.leave_chat(&group.id, "carol").await.unwrap();
    app.send(&group.id, "alice", "after carol left").await;

    match next_event(&mut carol).await {
        Event::MemberLeft { user_id, .. } => assert_eq!(user_id, "carol"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(carol.recv().await.is_none());

    // Bob stays subscribed and still gets the message.
    assert!(matches!(next_event(&mut bob).await, Event::MemberLeft { .. }));
    assert!(matches!(next_event(&mut bob).await, Event::ChatChanged { .. }));
    match next_event(&mut bob).await {
        Event::MessageInserted(m) => assert_eq!(m.content.as_deref(), Some("after carol left")),
        other => panic!("unexpected {:?}", other),
    }
}
