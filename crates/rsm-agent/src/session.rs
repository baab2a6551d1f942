//! Coordinator session: connect, re-validate, execute, report.
//!
//! The agent keeps exactly one live session. On connect failure or close it
//! retries with capped exponential backoff and jitter. Incoming commands
//! are re-validated against the local policy before anything is spawned;
//! concurrent commands run on their own tasks and funnel results through
//! one outbound channel so the socket has a single writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{info, warn};

use rsm_core::protocol::Frame;

use crate::config::AgentConfig;
use crate::executor;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RunningCommands = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

pub async fn run(config: Arc<AgentConfig>) {
    let mut backoff = config.reconnect_initial;
    loop {
        match connect_async(config.endpoint.as_str()).await {
            Ok((ws, _)) => {
                info!(event = "connected");
                backoff = config.reconnect_initial;
                drive_session(&config, ws).await;
                warn!(event = "disconnected");
            }
            Err(err) => {
                warn!(event = "connect_error", error = %err);
            }
        }
        let delay = with_jitter(backoff);
        info!(event = "reconnect_wait", millis = delay.as_millis() as u64);
        tokio::time::sleep(delay).await;
        backoff = next_backoff(backoff, config.reconnect_cap);
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    let next = current + current;
    if next > cap {
        cap
    } else {
        next
    }
}

fn with_jitter(base: Duration) -> Duration {
    let millis = base.as_millis() as u64;
    if millis == 0 {
        return base;
    }
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis + millis / 2);
    Duration::from_millis(jittered)
}

async fn drive_session(config: &Arc<AgentConfig>, mut ws: Ws) {
    let (tx, mut rx) = mpsc::channel::<Frame>(64);
    let running: RunningCommands = Arc::new(Mutex::new(HashMap::new()));
    let mut last_activity = Instant::now();
    let mut ticker = tokio::time::interval(config.ping_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        handle_frame(config, text.as_bytes(), &tx, &running).await;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        last_activity = Instant::now();
                        handle_frame(config, &bytes, &tx, &running).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        last_activity = Instant::now();
                        if ws.send(Message::Pong(payload)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(event = "server_close", frame = ?frame);
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(event = "read_error", error = %err);
                        return;
                    }
                    None => return,
                }
            }
            Some(frame) = rx.recv() => {
                if ws.send(Message::Text(frame.encode())).await.is_err() {
                    return;
                }
            }
            _ = ticker.tick() => {
                if last_activity.elapsed() >= config.ping_interval {
                    if ws.send(Message::Text(Frame::Ping.encode())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_frame(
    config: &Arc<AgentConfig>,
    data: &[u8],
    tx: &mpsc::Sender<Frame>,
    running: &RunningCommands,
) {
    match Frame::decode(data) {
        Ok(Frame::Command {
            command_id,
            command,
            timeout,
            ..
        }) => {
            info!(event = "command_received", command_id = %command_id);
            let config = config.clone();
            let tx = tx.clone();
            let running = running.clone();
            tokio::spawn(run_command(config, command_id, command, timeout, tx, running));
        }
        Ok(Frame::Ping) => {
            let _ = tx.send(Frame::Pong).await;
        }
        Ok(Frame::Pong) => {}
        Ok(Frame::Cancel { command_id }) => {
            let guard = running.lock().await;
            if let Some(notify) = guard.get(&command_id) {
                info!(event = "cancel_hint", command_id = %command_id);
                notify.notify_one();
            }
        }
        Ok(Frame::Welcome { agent_id, policy }) => {
            info!(event = "welcome", agent_id = %agent_id);
            if policy != config.policy.echo() {
                warn!(event = "policy_mismatch");
            }
        }
        Ok(frame) => {
            warn!(event = "unexpected_frame", frame = ?frame);
        }
        Err(err) => {
            warn!(event = "frame_invalid", error = %err);
        }
    }
}

async fn run_command(
    config: Arc<AgentConfig>,
    command_id: String,
    command: String,
    timeout: u32,
    tx: mpsc::Sender<Frame>,
    running: RunningCommands,
) {
    // Defense in depth: the coordinator validated already, but only the
    // local policy is trusted here.
    if let Err(rejection) = config.policy.validate(&command) {
        warn!(event = "command_rejected", command_id = %command_id, reason = rejection.kind());
        let _ = tx
            .send(Frame::Error {
                command_id: Some(command_id),
                error: rejection.to_string(),
            })
            .await;
        return;
    }

    let effective = config.policy.clamp_timeout(Some(timeout));
    let cancel = Arc::new(Notify::new());
    running
        .lock()
        .await
        .insert(command_id.clone(), cancel.clone());

    let outcome = tokio::select! {
        outcome = executor::execute(
            &command,
            Duration::from_secs(u64::from(effective)),
            config.max_output_bytes,
        ) => outcome,
        _ = cancel.notified() => {
            // Dropping the execute future kills the child.
            running.lock().await.remove(&command_id);
            warn!(event = "command_killed", command_id = %command_id);
            let _ = tx
                .send(Frame::Error {
                    command_id: Some(command_id),
                    error: "cancelled by coordinator".to_string(),
                })
                .await;
            return;
        }
    };
    running.lock().await.remove(&command_id);

    match outcome {
        Ok(result) => {
            if result.timed_out {
                warn!(event = "command_deadline", command_id = %command_id);
            } else {
                info!(event = "command_done", command_id = %command_id, exit_code = result.exit_code);
            }
            let _ = tx
                .send(Frame::Result {
                    command_id,
                    stdout: result.stdout,
                    stderr: result.stderr,
                    exit_code: result.exit_code,
                    execution_time: result.execution_time,
                })
                .await;
        }
        Err(err) => {
            warn!(event = "spawn_failed", command_id = %command_id, error = %err);
            let _ = tx
                .send(Frame::Error {
                    command_id: Some(command_id),
                    error: err.to_string(),
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        let cap = Duration::from_secs(60);
        let mut backoff = Duration::from_secs(1);
        backoff = next_backoff(backoff, cap);
        assert_eq!(backoff, Duration::from_secs(2));
        for _ in 0..10 {
            backoff = next_backoff(backoff, cap);
        }
        assert_eq!(backoff, cap);
    }

    #[test]
    fn jitter_stays_in_band() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let jittered = with_jitter(base);
            assert!(jittered >= Duration::from_millis(500));
            assert!(jittered <= Duration::from_millis(1500));
        }
    }
}
