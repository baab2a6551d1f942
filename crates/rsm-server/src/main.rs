use std::net::SocketAddr;

use tracing::{error, info, warn};

use rsm_core::tokens::TokenMap;
use rsm_server::{api, build_state, config};
use rsm_storage::Store;

#[tokio::main]
async fn main() {
    let server_config = config::load_config();
    let _log_guard = config::init_logging(&server_config);

    let tokens = match TokenMap::parse(&server_config.tokens_spec) {
        Ok(tokens) => tokens,
        Err(err) => {
            error!(event = "invalid_tokens", error = %err);
            return;
        }
    };
    if tokens.is_empty() {
        warn!(event = "no_tokens_configured");
    } else {
        info!(event = "tokens_loaded", count = tokens.len());
    }

    let store = match Store::open(&server_config.store_path) {
        Ok(store) => store,
        Err(err) => {
            error!(event = "store_open_failed", path = %server_config.store_path, error = %err);
            return;
        }
    };

    // Restart policy: anything left in flight by the previous run fails
    // fast, and agents start offline until a session binds.
    match store.fail_interrupted("coordinator restart") {
        Ok(swept) if swept > 0 => warn!(event = "interrupted_commands_failed", count = swept),
        Ok(_) => {}
        Err(err) => error!(event = "store_error", error = %err),
    }
    if let Err(err) = store.mark_all_agents_offline() {
        error!(event = "store_error", error = %err);
    }

    let addr: SocketAddr = match server_config.listen_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(event = "invalid_addr", addr = %server_config.listen_addr, error = %err);
            return;
        }
    };

    let state = build_state(server_config, store, tokens);
    start_retention_sweeper(state.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(event = "bind_failed", addr = %addr, error = %err);
            return;
        }
    };
    info!(event = "server_start", addr = %addr);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_requested");
    };
    if let Err(err) = axum::serve(listener, api::router(state.clone()))
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "server_error", error = %err);
    }

    state.engine.shutdown().await;
    info!(event = "server_stopped");
}

fn start_retention_sweeper(state: rsm_server::AppState) {
    let days = state.config.history_retention_days;
    if days == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(24 * 60 * 60));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(days));
            let result = {
                let store = state.store.lock().await;
                store.purge_older_than(cutoff)
            };
            match result {
                Ok(deleted) if deleted > 0 => {
                    info!(event = "retention_sweep", deleted, days)
                }
                Ok(_) => {}
                Err(err) => warn!(event = "store_error", error = %err),
            }
        }
    });
}
