//! Coordinator for the RemoteShell dispatch fabric.
//!
//! Owns the lifecycle store, the per-agent queue engine, the agent
//! WebSocket sessions, and the REST surface. The binary in `main.rs` wires
//! configuration and startup; everything else lives here so integration
//! tests can drive the engine and the socket endpoint directly.

pub mod api;
pub mod config;
pub mod queue;
pub mod session;

use std::sync::Arc;

use rsm_core::tokens::TokenMap;
use rsm_storage::Store;

pub use config::ServerConfig;
pub use queue::{
    CancelOutcome, EngineCounters, Outbound, QueueEngine, SessionHandle, SubmitError,
    SubmitReceipt,
};

/// The store is synchronous rusqlite behind an async mutex; each operation
/// is one lock acquisition, so store calls stay linearizable without any
/// lock held across other awaits.
pub type SharedStore = Arc<tokio::sync::Mutex<Store>>;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: SharedStore,
    pub engine: Arc<QueueEngine>,
    pub tokens: Arc<TokenMap>,
    pub counters: Arc<EngineCounters>,
}

pub fn build_state(config: ServerConfig, store: Store, tokens: TokenMap) -> AppState {
    let config = Arc::new(config);
    let store: SharedStore = Arc::new(tokio::sync::Mutex::new(store));
    let counters = Arc::new(EngineCounters::default());
    let engine = Arc::new(QueueEngine::new(
        store.clone(),
        config.policy.clone(),
        config.max_queue_size,
        config.grace,
        counters.clone(),
    ));
    AppState {
        config,
        store,
        engine,
        tokens: Arc::new(tokens),
        counters,
    }
}
