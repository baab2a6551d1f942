//! Agent WebSocket sessions.
//!
//! One session per connected agent. The socket URL carries the bearer token
//! as a query parameter; an unknown token closes the socket with 1008
//! before any frame is read. An authenticated session binds to the queue
//! engine, echoes the effective policy in a `welcome` frame, and then
//! shuttles frames until the peer goes away, the coordinator shuts down
//! (1001), a newer session supersedes it (4000), or liveness is lost
//! (4001).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tracing::{info, warn};

use rsm_core::protocol::Frame;
use rsm_core::types::AgentStatus;

use crate::queue::{Outbound, SessionHandle};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    token: String,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Resolve the token before the upgrade completes; the socket task only
    // learns the derived agent id, never the token itself.
    let agent_id = state
        .tokens
        .agent_for_token(&params.token)
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(state, socket, agent_id))
}

async fn handle_socket(state: AppState, socket: WebSocket, agent_id: Option<String>) {
    let Some(agent_id) = agent_id else {
        warn!(event = "auth_failed");
        let mut socket = socket;
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "invalid token".into(),
            })))
            .await;
        return;
    };

    let conn_id = state.engine.next_conn_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Outbound>(256);

    // Single socket writer: everything outbound funnels through the channel.
    let write_timeout = state.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Frame(frame) => {
                    let send = ws_sender.send(Message::Text(frame.encode()));
                    match tokio::time::timeout(write_timeout, send).await {
                        Ok(Ok(())) => {}
                        _ => return,
                    }
                }
                Outbound::Close { code, reason } => {
                    let close = ws_sender.send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })));
                    let _ = tokio::time::timeout(write_timeout, close).await;
                    return;
                }
            }
        }
    });

    {
        let store = state.store.lock().await;
        let marked = store
            .upsert_agent(&agent_id, None)
            .and_then(|_| store.mark_agent(&agent_id, AgentStatus::Online));
        if let Err(err) = marked {
            // The session stays up; dispatch pauses on its own store errors.
            warn!(event = "store_error", agent_id = %agent_id, error = %err);
        }
    }

    state
        .engine
        .bind(
            &agent_id,
            SessionHandle {
                conn_id,
                frames: tx.clone(),
            },
        )
        .await;
    let _ = tx
        .send(Outbound::Frame(Frame::Welcome {
            agent_id: agent_id.clone(),
            policy: state.config.policy.echo(),
        }))
        .await;
    info!(event = "session_active", agent_id = %agent_id, conn_id);

    let last_seen = Arc::new(AsyncMutex::new(Instant::now()));

    // Keep-alive: ping every interval, close 4001 when the peer has been
    // silent for more than two intervals.
    let ping_task = tokio::spawn({
        let tx = tx.clone();
        let last_seen = last_seen.clone();
        let interval = state.config.ping_interval;
        let agent = agent_id.clone();
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let idle = last_seen.lock().await.elapsed();
                if idle > interval * 2 {
                    warn!(event = "liveness_lost", agent_id = %agent);
                    let _ = tx
                        .send(Outbound::Close {
                            code: 4001,
                            reason: "liveness_lost".to_string(),
                        })
                        .await;
                    return;
                }
                if tx.send(Outbound::Frame(Frame::Ping)).await.is_err() {
                    return;
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        let msg = match result {
            Ok(msg) => msg,
            Err(err) => {
                warn!(event = "read_error", agent_id = %agent_id, error = %err);
                break;
            }
        };
        let data = match msg {
            Message::Text(text) => text.into_bytes(),
            Message::Binary(bytes) => bytes,
            Message::Close(_) => {
                info!(event = "peer_close", agent_id = %agent_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                *last_seen.lock().await = Instant::now();
                continue;
            }
        };
        *last_seen.lock().await = Instant::now();

        match Frame::decode(&data) {
            Ok(Frame::Ping) => {
                let _ = tx.send(Outbound::Frame(Frame::Pong)).await;
            }
            Ok(Frame::Pong) => {}
            Ok(frame @ (Frame::Result { .. } | Frame::Error { .. })) => {
                state.engine.agent_frame(&agent_id, frame).await;
            }
            Ok(frame) => {
                state.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = "unexpected_frame", agent_id = %agent_id, frame = ?frame);
            }
            Err(err) => {
                state.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = "frame_invalid", agent_id = %agent_id, error = %err);
            }
        }
    }

    // A superseded session must not flip the agent offline; only the
    // currently bound connection does the store bookkeeping.
    let was_bound = state.engine.unbind(&agent_id, conn_id).await;
    if was_bound {
        let store = state.store.lock().await;
        if let Err(err) = store.mark_agent(&agent_id, AgentStatus::Offline) {
            warn!(event = "store_error", agent_id = %agent_id, error = %err);
        }
    }
    ping_task.abort();
    drop(tx);
    let _ = write_task.await;
    info!(event = "session_closed", agent_id = %agent_id, conn_id);
}
