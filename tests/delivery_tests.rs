//! Delivery state machine and ordered fan-out.

mod common;

use common::*;
use courier_server::error::AppError;
use courier_server::events::{Event, Topic};
use courier_server::models::*;

#[tokio::test]
async fn test_subscriber_sees_sent_delivered_read_in_order() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let mut sub = app.state.hub.subscribe(Topic::chat(&chat.id));

    let message = app.send(&chat.id, "alice", "hello").await;
    let ids = vec![message.id.clone()];
    app.state.delivery.mark_delivered(&ids, "bob").await.unwrap();
    app.state.delivery.mark_read(&ids, "bob").await.unwrap();

    match next_event(&mut sub).await {
        Event::MessageInserted(m) => {
            assert_eq!(m.id, message.id);
            assert_eq!(m.status, MessageStatus::Sent);
        }
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut sub).await {
        Event::MessageUpdated(m) => assert_eq!(m.status, MessageStatus::Delivered),
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut sub).await {
        Event::MessageUpdated(m) => {
            assert_eq!(m.status, MessageStatus::Read);
            assert!(m.read_at.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }

    // Delivered after read changes nothing and publishes nothing.
    app.state.delivery.mark_delivered(&ids, "bob").await.unwrap();
    assert!(stays_quiet(&mut sub).await);
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Read);
}

#[tokio::test]
async fn test_status_never_regresses_under_races() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    for _ in 0..5 {
        let message = app.send(&chat.id, "alice", "race").await;
        let ids = vec![message.id.clone()];
        let (delivered, read) = tokio::join!(
            app.state.delivery.mark_delivered(&ids, "bob"),
            app.state.delivery.mark_read(&ids, "bob"),
        );
        delivered.unwrap();
        read.unwrap();
        assert_eq!(app.message(&message.id).await.status, MessageStatus::Read);
    }
}

#[tokio::test]
async fn test_own_messages_are_not_advanced() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let message = app.send(&chat.id, "alice", "mine").await;
    app.state
        .delivery
        .mark_read(&[message.id.clone()], "alice")
        .await
        .unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Sent);
}

#[tokio::test]
async fn test_batch_is_rejected_before_anything_moves() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "mallory"]).await;
    let chat = app.private_chat("alice", "bob").await;
    let message = app.send(&chat.id, "alice", "hi").await;

    let err = app
        .state
        .delivery
        .mark_delivered(&[message.id.clone(), "missing".to_string()], "bob")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Sent);

    let err = app
        .state
        .delivery
        .mark_read(&[message.id.clone()], "mallory")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_group_is_read_only_when_everyone_has_read() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol"]).await;
    let group = app.group("alice", &["bob", "carol"]).await;

    let message = app.send(&group.id, "alice", "standup?").await;
    let ids = vec![message.id.clone()];

    app.state.delivery.mark_read(&ids, "bob").await.unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Delivered);

    let summary = app
        .state
        .delivery
        .read_receipts(&message.id, "alice")
        .await
        .unwrap();
    assert_eq!(summary.readers.len(), 1);
    assert_eq!(summary.total_recipients, 2);

    // Reading twice does not count twice.
    app.state.delivery.mark_read(&ids, "bob").await.unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Delivered);

    app.state.delivery.mark_read(&ids, "carol").await.unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Read);

    let summary = app
        .state
        .delivery
        .read_receipts(&message.id, "bob")
        .await
        .unwrap();
    assert_eq!(summary.readers.len(), 2);
}

#[tokio::test]
async fn test_hidden_read_receipts_stop_at_delivered() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let prefs = PrivacyPrefs {
        show_read_receipts: false,
        ..PrivacyPrefs::default()
    };
    app.state.storage.update_privacy_prefs("bob", &prefs).await.unwrap();

    let message = app.send(&chat.id, "alice", "seen?").await;
    app.state
        .delivery
        .mark_read(&[message.id.clone()], "bob")
        .await
        .unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Delivered);

    // Nor does the receipt list give bob away.
    let summary = app
        .state
        .delivery
        .read_receipts(&message.id, "alice")
        .await
        .unwrap();
    assert!(summary.readers.is_empty());
}

#[tokio::test]
async fn test_recipients_get_notification_and_unread() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    let mut bob = app.state.hub.subscribe(Topic::user("bob"));
    let mut alice = app.state.hub.subscribe(Topic::user("alice"));

    let message = app.send(&chat.id, "alice", "ping").await;

    match next_event(&mut bob).await {
        Event::Notification(n) => {
            assert_eq!(n.message_id, message.id);
            assert_eq!(n.preview, "ping");
            assert!(!n.muted);
        }
        other => panic!("unexpected {:?}", other),
    }
    match next_event(&mut bob).await {
        Event::UnreadChanged { chat_id, unread_count } => {
            assert_eq!(chat_id, chat.id);
            assert_eq!(unread_count, 1);
        }
        other => panic!("unexpected {:?}", other),
    }

    // The sender is not notified of their own message.
    assert!(stays_quiet(&mut alice).await);
}

#[tokio::test]
async fn test_edit_and_delete_follow_the_insert() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;
    let mut sub = app.state.hub.subscribe(Topic::chat(&chat.id));

    let message = app.send(&chat.id, "alice", "draft").await;
    app.state.messages.edit(&message.id, "alice", "final").await.unwrap();
    app.state.messages.soft_delete(&message.id, "alice").await.unwrap();

    let inserted = match next_event(&mut sub).await {
        Event::MessageInserted(m) => m,
        other => panic!("unexpected {:?}", other),
    };
    let updated = match next_event(&mut sub).await {
        Event::MessageUpdated(m) => m,
        other => panic!("unexpected {:?}", other),
    };
    let deleted = match next_event(&mut sub).await {
        Event::MessageDeleted(m) => m,
        other => panic!("unexpected {:?}", other),
    };

    assert!(updated.supersedes(&inserted));
    assert!(deleted.supersedes(&updated));
    assert!(deleted.content.is_none());
}

#[tokio::test]
async fn test_status_writes_are_visible_to_the_next_read() {
    let app = spawn_app().await;
    app.users(&["alice", "bob"]).await;
    let chat = app.private_chat("alice", "bob").await;

    for _ in 0..5 {
        let message = app.send(&chat.id, "alice", "now").await;

        let delivered = app
            .state
            .storage
            .advance_to_delivered(&message.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered.status, MessageStatus::Delivered);
        // Every pooled connection sees the committed write.
        for _ in 0..3 {
            assert_eq!(app.message(&message.id).await.status, MessageStatus::Delivered);
        }

        let read = app
            .state
            .storage
            .advance_to_read(&message.id, false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.status, MessageStatus::Read);
        for _ in 0..3 {
            assert_eq!(app.message(&message.id).await.status, MessageStatus::Read);
        }
    }
}

#[tokio::test]
async fn test_late_joiners_do_not_hold_back_read() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol", "dave"]).await;
    let group = app.group("alice", &["bob", "carol"]).await;

    let message = app.send(&group.id, "alice", "before dave").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    app.state.chats.add_member(&group.id, "alice", "dave").await.unwrap();

    let ids = vec![message.id.clone()];
    app.state.delivery.mark_read(&ids, "bob").await.unwrap();
    app.state.delivery.mark_read(&ids, "carol").await.unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Read);

    let summary = app
        .state
        .delivery
        .read_receipts(&message.id, "dave")
        .await
        .unwrap();
    assert_eq!(summary.total_recipients, 2);
    assert_eq!(summary.readers.len(), 2);
}

#[tokio::test]
async fn test_readers_who_left_are_not_counted() {
    let app = spawn_app().await;
    app.users(&["alice", "bob", "carol"]).await;
    let group = app.group("alice", &["bob", "carol"]).await;

    let message = app.send(&group.id, "alice", "bye?").await;
    let ids = vec![message.id.clone()];

    app.state.delivery.mark_read(&ids, "bob").await.unwrap();
    app.state.chats.leave_chat(&group.id, "bob").await.unwrap();

    let summary = app
        .state
        .delivery
        .read_receipts(&message.id, "alice")
        .await
        .unwrap();
    assert!(summary.readers.is_empty());
    assert_eq!(summary.total_recipients, 1);
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Delivered);

    app.state.delivery.mark_read(&ids, "carol").await.unwrap();
    assert_eq!(app.message(&message.id).await.status, MessageStatus::Read);

    let summary = app
        .state
        .delivery
        .read_receipts(&message.id, "alice")
        .await
        .unwrap();
    assert_eq!(summary.readers.len(), 1);
    assert_eq!(summary.readers[0].user_id, "carol");
}
