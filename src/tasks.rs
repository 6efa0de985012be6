//! Background sweeps owned by the process.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::models::now_ms;
use crate::AppState;

const CALL_EXPIRY_INTERVAL: Duration = Duration::from_secs(1);
const SESSION_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Start every sweep. Dropping the handles does not stop them; abort to stop.
pub fn spawn_all(state: &AppState) -> Vec<JoinHandle<()>> {
    vec![
        spawn_scheduler(state.clone()),
        spawn_presence_sweep(state.clone()),
        spawn_call_expiry(state.clone()),
        spawn_session_cleanup(state.clone()),
    ]
}

fn spawn_scheduler(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_millis(state.config.storage.scheduler_interval_ms.max(10));
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            if let Err(e) = state.messages.promote_due(now_ms()).await {
                tracing::error!("Scheduled promotion failed: {}", e);
            }
        }
    })
}

fn spawn_presence_sweep(state: AppState) -> JoinHandle<()> {
    let period = Duration::from_secs(state.config.presence.sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = ticker(period);
        loop {
            interval.tick().await;
            let expired = state.presence.sweep().await;
            if !expired.is_empty() {
                tracing::debug!("Liveness sweep expired {} users", expired.len());
            }
        }
    })
}

fn spawn_call_expiry(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(CALL_EXPIRY_INTERVAL);
        loop {
            interval.tick().await;
            match state.calls.expire_unanswered(now_ms()).await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Expired {} unanswered calls", n),
                Err(e) => tracing::error!("Call expiry failed: {}", e),
            }
        }
    })
}

fn spawn_session_cleanup(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = ticker(SESSION_CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match state.storage.cleanup_expired_sessions().await {
                Ok(0) => {}
                Ok(n) => tracing::info!("Cleanup: removed {} expired sessions", n),
                Err(e) => tracing::error!("Cleanup failed: {}", e),
            }
        }
    })
}
