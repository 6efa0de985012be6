//! WebSocket handler for real-time communication
//!
//! One socket is one session. The first frame must authenticate; after that
//! the client subscribes to chats and issues commands. Each subscription is
//! a forwarder task pumping a hub topic into the socket's outbound channel,
//! and every forwarder is aborted when the socket goes away.
//!
//! The outbound channel is bounded. Direct replies wait for room; forwarders
//! never wait. A forwarder that finds the channel full drops the event and
//! sends `resync` for its topic once there is room again.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::{
    directory::Directory,
    error::AppError,
    events::Topic,
    fanout::{Delivery, Subscription},
    protocol::{WsClientMessage, WsServerMessage},
    sessions::{SessionInfo, Transition},
    AppState,
};

type Outbound = mpsc::Sender<WsServerMessage>;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<WsServerMessage>(state.config.fanout.socket_buffer.max(1));

    // Task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if ws_sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to encode frame: {}", e),
            }
        }
    });

    let mut conn = Connection {
        state,
        tx,
        session: None,
        forwarders: HashMap::new(),
    };

    // Handle incoming messages
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsClientMessage>(&text) {
                Ok(client_msg) => conn.handle(client_msg).await,
                Err(e) => {
                    tracing::warn!("Failed to parse WebSocket message: {}", e);
                    conn.send(WsServerMessage::Error {
                        code: "PARSE_ERROR".to_string(),
                        message: format!("Invalid message format: {}", e),
                    })
                    .await;
                }
            },
            Ok(Message::Close(_)) => break,
            // Binary is unsupported; ping/pong are handled by axum.
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("WebSocket error: {}", e);
                break;
            }
        }
    }

    conn.close().await;
    send_task.abort();
}

struct Connection {
    state: AppState,
    tx: Outbound,
    session: Option<SessionInfo>,
    forwarders: HashMap<Topic, JoinHandle<()>>,
}

impl Connection {
    async fn send(&self, msg: WsServerMessage) {
        let _ = self.tx.send(msg).await;
    }

    async fn send_error(&self, err: &AppError) {
        self.send(WsServerMessage::Error {
            code: err.code().to_string(),
            message: err.public_message(),
        })
        .await;
    }

    async fn handle(&mut self, msg: WsClientMessage) {
        match &msg {
            WsClientMessage::Authenticate { token } => {
                if self.session.is_some() {
                    self.send_error(&AppError::invalid_state("already authenticated")).await;
                } else {
                    let token = token.clone();
                    self.authenticate(&token).await;
                }
                return;
            }
            WsClientMessage::Ping => {
                self.send(WsServerMessage::Pong).await;
                return;
            }
            _ => {}
        }

        let Some(user_id) = self.session.as_ref().map(|s| s.user_id.clone()) else {
            self.send_error(&AppError::Unauthorized).await;
            return;
        };

        let state = self.state.clone();
        let result = match msg {
            WsClientMessage::Subscribe { chat_id } => self.subscribe_chat(&user_id, chat_id).await,

            WsClientMessage::Unsubscribe { chat_id } => {
                if let Some(forwarder) = self.forwarders.remove(&Topic::chat(&chat_id)) {
                    forwarder.abort();
                }
                self.send(WsServerMessage::Unsubscribed { chat_id }).await;
                Ok(())
            }

            WsClientMessage::Send {
                chat_id,
                client_ref,
                message,
            } => {
                match state.messages.append(&chat_id, &user_id, message).await {
                    Ok(outcome) => {
                        state.presence.clear_typing(&chat_id, &user_id);
                        self.send(WsServerMessage::Ack {
                            client_ref,
                            message: outcome,
                        })
                        .await;
                    }
                    Err(e) => {
                        tracing::warn!("Send from {} to {} rejected: {}", user_id, chat_id, e);
                        self.send(WsServerMessage::SendFailed {
                            client_ref,
                            code: e.code().to_string(),
                            retryable: e.is_retryable(),
                            message: e.public_message(),
                        })
                        .await;
                    }
                }
                Ok(())
            }

            WsClientMessage::Typing { chat_id, activity } => {
                state.presence.set_typing(&chat_id, &user_id, activity).await;
                Ok(())
            }

            WsClientMessage::StopTyping { chat_id } => {
                state.presence.clear_typing(&chat_id, &user_id);
                Ok(())
            }

            WsClientMessage::Presence { status } => {
                state.presence.set_presence(&user_id, status).await;
                Ok(())
            }

            WsClientMessage::Heartbeat => {
                state.presence.heartbeat(&user_id).await;
                Ok(())
            }

            WsClientMessage::MarkDelivered { message_ids } => {
                state.delivery.mark_delivered(&message_ids, &user_id).await
            }

            WsClientMessage::MarkRead { message_ids } => state.mark_read(&user_id, &message_ids).await,

            WsClientMessage::CallSignal { call_id, signal } => {
                state.calls.relay_signal(&call_id, &user_id, signal).await
            }

            WsClientMessage::Authenticate { .. } | WsClientMessage::Ping => Ok(()),
        };

        if let Err(e) = result {
            tracing::warn!("Command from {} rejected: {}", user_id, e);
            self.send_error(&e).await;
        }
    }

    async fn authenticate(&mut self, token: &str) {
        let session = match self.state.storage.validate_session(token).await {
            Ok(Some(session)) => session,
            Ok(None) => {
                self.send(WsServerMessage::Error {
                    code: "AUTH_FAILED".to_string(),
                    message: "Invalid or expired token".to_string(),
                })
                .await;
                return;
            }
            Err(e) => {
                self.send_error(&e).await;
                return;
            }
        };

        let (info, transition) = self.state.sessions.register(&session.user_id);

        // The user topic first, so nothing addressed to them is missed.
        let topic = Topic::user(&info.user_id);
        let subscription = self.state.hub.subscribe(topic.clone());
        let forwarder = forward(subscription, self.tx.clone(), Arc::clone(&self.state.directory));
        self.forwarders.insert(topic, forwarder);

        self.send(WsServerMessage::Authenticated {
            user_id: info.user_id.clone(),
            session_id: info.session_id.clone(),
        })
        .await;

        if transition == Transition::Edge {
            self.state.presence.session_started(&info.user_id).await;
        }

        tracing::info!(
            "WebSocket authenticated: user={}, session={}",
            info.user_id,
            info.session_id
        );
        self.session = Some(info);
    }

    async fn subscribe_chat(&mut self, user_id: &str, chat_id: String) -> crate::error::Result<()> {
        if !self.state.directory.is_member(&chat_id, user_id).await? {
            return Err(AppError::permission("not a member of this chat"));
        }

        let topic = Topic::chat(&chat_id);
        // A finished forwarder belongs to an earlier membership.
        let live = self
            .forwarders
            .get(&topic)
            .map(|forwarder| !forwarder.is_finished())
            .unwrap_or(false);
        if !live {
            let subscription = self.state.hub.subscribe_member(topic.clone(), user_id);
            let forwarder = forward(subscription, self.tx.clone(), Arc::clone(&self.state.directory));
            self.forwarders.insert(topic, forwarder);
        }

        self.send(WsServerMessage::Subscribed { chat_id }).await;
        Ok(())
    }

    /// Runs on every exit path of the socket loop.
    async fn close(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }

        let Some(info) = self.session.take() else {
            return;
        };

        if let Some((user_id, Transition::Edge)) = self.state.sessions.unregister(&info.session_id) {
            self.state.presence.session_ended(&user_id).await;
        }

        tracing::info!(
            "WebSocket closed: user={}, session={}",
            info.user_id,
            info.session_id
        );
    }
}

/// Pump a subscription into the socket until the socket goes away, the task
/// is aborted, or the member leaves the chat. Taking the subscription before
/// spawning means nothing published after the subscribe call is missed.
fn forward(mut subscription: Subscription, tx: Outbound, directory: Arc<dyn Directory>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let topic = subscription.topic().clone();
        let mut behind = false;

        while let Some(delivery) = subscription.recv().await {
            let frame = match delivery {
                Delivery::Event(event) => WsServerMessage::Event {
                    topic: topic.clone(),
                    event,
                },
                Delivery::Lagged(skipped) => {
                    tracing::warn!("Subscriber of {} lagged by {} events", topic, skipped);
                    // A MemberLeft may have been among the skipped events.
                    if !still_member(&*directory, &subscription).await {
                        break;
                    }
                    WsServerMessage::Resync { topic: topic.clone() }
                }
            };

            if behind {
                match tx.try_send(WsServerMessage::Resync { topic: topic.clone() }) {
                    Ok(()) => behind = false,
                    Err(TrySendError::Full(_)) => continue,
                    Err(TrySendError::Closed(_)) => return,
                }
            }

            match tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Socket queue full, dropping {} events until it drains", topic);
                    behind = true;
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }

        if let Topic::Chat(chat_id) = topic {
            tracing::debug!("Forwarder for chat {} ended", chat_id);
            let _ = tx.send(WsServerMessage::Unsubscribed { chat_id }).await;
        }
    })
}

async fn still_member(directory: &dyn Directory, subscription: &Subscription) -> bool {
    match (subscription.topic(), subscription.member()) {
        (Topic::Chat(chat_id), Some(user_id)) => directory.is_member(chat_id, user_id).await.unwrap_or(true),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::directory::SqlDirectory;
    use crate::events::Event;
    use crate::fanout::Hub;
    use crate::storage::Storage;

    fn stopped(n: usize) -> Event {
        Event::TypingStopped {
            chat_id: "c".to_string(),
            user_id: n.to_string(),
        }
    }

    fn assert_stopped(frame: Option<WsServerMessage>, n: usize) {
        match frame {
            Some(WsServerMessage::Event {
                event: Event::TypingStopped { user_id, .. },
                ..
            }) => assert_eq!(user_id, n.to_string()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_socket_queue_drops_then_resyncs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ws.db");
        let storage = Arc::new(Storage::new(path.to_str().unwrap()).await.unwrap());
        let directory: Arc<dyn Directory> = Arc::new(SqlDirectory::new(storage));

        let hub = Arc::new(Hub::new(64));
        let topic = Topic::user("alice");
        let (tx, mut rx) = mpsc::channel(2);
        let forwarder = forward(hub.subscribe(topic.clone()), tx, directory);

        // Nobody drains the socket while five events arrive.
        for n in 0..5 {
            hub.publish(&topic, stopped(n));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_stopped(rx.recv().await, 0);
        assert_stopped(rx.recv().await, 1);
        assert!(rx.try_recv().is_err());

        // Once there is room the client is told to refetch, then the stream resumes.
        hub.publish(&topic, stopped(5));
        assert!(matches!(rx.recv().await, Some(WsServerMessage::Resync { .. })));
        assert_stopped(rx.recv().await, 5);

        forwarder.abort();
    }
}
