//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use courier_server::config::Config;
use courier_server::events::Event;
use courier_server::fanout::{Delivery, Subscription};
use courier_server::models::*;
use courier_server::AppState;
use tempfile::TempDir;

pub struct TestApp {
    pub state: AppState,
    _dir: TempDir,
}

pub async fn spawn_app() -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.database_path = dir
        .path()
        .join("courier.db")
        .to_string_lossy()
        .into_owned();

    let state = AppState::open(config).await.unwrap();
    TestApp { state, _dir: dir }
}

impl TestApp {
    pub async fn users(&self, ids: &[&str]) {
        for id in ids {
            self.state.storage.create_user(id, None).await.unwrap();
        }
    }

    pub async fn private_chat(&self, a: &str, b: &str) -> Chat {
        self.state.chats.get_or_create_private_chat(a, b).await.unwrap()
    }

    pub async fn group(&self, owner: &str, members: &[&str]) -> Chat {
        let members: Vec<String> = members.iter().map(|m| m.to_string()).collect();
        self.state
            .chats
            .create_group(owner, "team", ChatType::Group, &members)
            .await
            .unwrap()
    }

    pub async fn send(&self, chat_id: &str, sender: &str, text: &str) -> Message {
        match self
            .state
            .messages
            .append(chat_id, sender, NewMessage::text(text))
            .await
            .unwrap()
        {
            AppendOutcome::Live(message) => message,
            other => panic!("expected a live message, got {:?}", other),
        }
    }

    pub async fn message(&self, id: &str) -> Message {
        self.state.storage.get_message(id).await.unwrap().unwrap()
    }

    pub async fn unread(&self, chat_id: &str, user: &str) -> i64 {
        self.state.aggregator.unread_count(chat_id, user).await.unwrap()
    }
}

/// Next event on `sub`, failing the test after two seconds.
pub async fn next_event(sub: &mut Subscription) -> Event {
    match tokio::time::timeout(Duration::from_secs(2), sub.recv()).await {
        Ok(Some(Delivery::Event(event))) => event,
        other => panic!("expected an event, got {:?}", other),
    }
}

/// True if nothing arrives on `sub` for a short while.
pub async fn stays_quiet(sub: &mut Subscription) -> bool {
    tokio::time::timeout(Duration::from_millis(100), sub.recv())
        .await
        .is_err()
}
