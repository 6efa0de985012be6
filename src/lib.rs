//! Courier Server - real-time message delivery and state synchronization
//!
//! This crate handles:
//! - Durable per-chat message logs with ordered fan-out
//! - Delivery/read state and unread counters
//! - Presence, typing indicators and liveness sweeps
//! - Call signaling between chat members
//! - Reactions and scheduled messages

pub mod aggregator;
pub mod calls;
pub mod chats;
pub mod config;
pub mod crypto;
pub mod delivery;
pub mod directory;
pub mod error;
pub mod events;
pub mod fanout;
pub mod handlers;
pub mod message_store;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod sessions;
pub mod storage;
pub mod tasks;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::aggregator::Aggregator;
use crate::calls::CallCoordinator;
use crate::chats::ChatService;
use crate::config::Config;
use crate::delivery::DeliveryTracker;
use crate::directory::{Directory, SqlDirectory};
use crate::fanout::Hub;
use crate::message_store::{MessageStore, Sequencer};
use crate::presence::PresenceTracker;
use crate::sessions::SessionRegistry;
use crate::storage::Storage;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub directory: Arc<dyn Directory>,
    pub hub: Arc<Hub>,
    pub sessions: Arc<SessionRegistry>,
    pub messages: Arc<MessageStore>,
    pub delivery: Arc<DeliveryTracker>,
    pub presence: Arc<PresenceTracker>,
    pub calls: Arc<CallCoordinator>,
    pub aggregator: Arc<Aggregator>,
    pub chats: Arc<ChatService>,
}

impl AppState {
    /// Open the database named in `config` and wire every component to it.
    pub async fn open(config: Config) -> anyhow::Result<Self> {
        let storage = Arc::new(Storage::new(&config.storage.database_path).await?);
        Ok(Self::new(config, storage))
    }

    pub fn new(config: Config, storage: Arc<Storage>) -> Self {
        let directory: Arc<dyn Directory> = Arc::new(SqlDirectory::new(Arc::clone(&storage)));
        let hub = Arc::new(Hub::new(config.fanout.topic_capacity));
        let sequencer = Arc::new(Sequencer::new());

        let messages = Arc::new(MessageStore::new(
            Arc::clone(&storage),
            Arc::clone(&directory),
            Arc::clone(&hub),
            Arc::clone(&sequencer),
            config.limits.clone(),
        ));
        let delivery = Arc::new(DeliveryTracker::new(
            Arc::clone(&storage),
            Arc::clone(&directory),
            Arc::clone(&hub),
            Arc::clone(&sequencer),
        ));
        let presence = Arc::new(PresenceTracker::new(
            Arc::clone(&directory),
            Arc::clone(&hub),
            &config.presence,
        ));
        let calls = Arc::new(CallCoordinator::new(
            Arc::clone(&storage),
            Arc::clone(&directory),
            Arc::clone(&hub),
            Duration::from_secs(config.calls.ring_timeout_secs),
        ));
        let aggregator = Arc::new(Aggregator::new(
            Arc::clone(&storage),
            Arc::clone(&directory),
            Arc::clone(&hub),
            Arc::clone(&sequencer),
            config.limits.max_emoji_bytes,
        ));
        let chats = Arc::new(ChatService::new(
            Arc::clone(&storage),
            Arc::clone(&directory),
            Arc::clone(&hub),
            sequencer,
        ));

        Self {
            config: Arc::new(config),
            storage,
            directory,
            hub,
            sessions: Arc::new(SessionRegistry::new()),
            messages,
            delivery,
            presence,
            calls,
            aggregator,
            chats,
        }
    }

    /// Mark messages read and move the reader's unread mark in each chat up
    /// to the newest message read there.
    pub async fn mark_read(&self, user_id: &str, message_ids: &[String]) -> error::Result<()> {
        self.delivery.mark_read(message_ids, user_id).await?;

        let mut newest: BTreeMap<String, i64> = BTreeMap::new();
        for message_id in message_ids {
            let message = self.messages.get(message_id, user_id).await?;
            let seq = newest.entry(message.chat_id).or_insert(message.seq);
            *seq = (*seq).max(message.seq);
        }

        for (chat_id, seq) in newest {
            self.aggregator.reset_unread(&chat_id, user_id, Some(seq)).await?;
        }

        Ok(())
    }
}

pub fn router(state: AppState) -> Router {
    use crate::handlers::{calls, chats, health, messages, presence, websocket};

    Router::new()
        // Health check
        .route("/health", get(health::health_check))

        // Chats
        .route("/api/v1/chats", get(chats::list_chats))
        .route("/api/v1/chats/private", post(chats::open_private_chat))
        .route("/api/v1/chats/group", post(chats::create_group))
        .route("/api/v1/chats/:chat_id", get(chats::get_chat))
        .route("/api/v1/chats/:chat_id/members", post(chats::add_member))
        .route("/api/v1/chats/:chat_id/leave", post(chats::leave_chat))
        .route("/api/v1/chats/:chat_id/flags", put(chats::set_flags))
        .route("/api/v1/chats/:chat_id/pin", put(chats::pin_message))
        .route("/api/v1/chats/:chat_id/viewed", post(chats::mark_viewed))
        .route("/api/v1/chats/:chat_id/typing", get(presence::typing_in).put(presence::set_typing))
        .route("/api/v1/chats/:chat_id/call", get(calls::live_call))
        .route("/api/v1/users/me/privacy", get(chats::get_privacy).put(chats::update_privacy))

        // Messages
        .route(
            "/api/v1/chats/:chat_id/messages",
            get(messages::list_messages).post(messages::append_message),
        )
        .route("/api/v1/messages/:message_id/forward", post(messages::forward_message))
        .route(
            "/api/v1/messages/:message_id",
            get(messages::get_message)
                .put(messages::edit_message)
                .delete(messages::delete_message),
        )
        .route("/api/v1/messages/:message_id/reference", get(messages::get_reference))
        .route(
            "/api/v1/messages/:message_id/reactions",
            get(messages::get_reactions).post(messages::toggle_reaction),
        )
        .route("/api/v1/messages/:message_id/receipts", get(messages::get_receipts))
        .route("/api/v1/messages/delivered", post(messages::mark_delivered))
        .route("/api/v1/messages/read", post(messages::mark_read))
        .route("/api/v1/scheduled", get(messages::list_scheduled))
        .route(
            "/api/v1/scheduled/:scheduled_id",
            put(messages::edit_scheduled).delete(messages::cancel_scheduled),
        )

        // Presence
        .route("/api/v1/presence", put(presence::set_presence))
        .route("/api/v1/presence/heartbeat", post(presence::heartbeat))
        .route("/api/v1/presence/:user_id", get(presence::get_presence))

        // Calls
        .route("/api/v1/calls", post(calls::initiate_call))
        .route("/api/v1/calls/:call_id", get(calls::get_call).delete(calls::end_call))
        .route("/api/v1/calls/:call_id/answer", post(calls::answer_call))
        .route("/api/v1/calls/:call_id/decline", post(calls::decline_call))
        .route("/api/v1/calls/:call_id/signal", post(calls::relay_signal))
        .route("/api/v1/calls/:call_id/participant", put(calls::update_participant))

        // WebSocket for real-time communication
        .route("/ws", get(websocket::websocket_handler))

        // Add middleware
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any),
                ),
        )
        .with_state(state)
}

/// Bind, start the background sweeps and serve until the listener fails.
pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let sweeps = tasks::spawn_all(&state);

    let result = axum::serve(listener, router(state)).await;
    for sweep in sweeps {
        sweep.abort();
    }

    result.map_err(Into::into)
}
