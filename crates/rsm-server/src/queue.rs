//! Per-agent command queues and the dispatch loops that drain them.
//!
//! Each agent's queue state is owned by a dedicated actor task fed by a
//! typed inbox, so every mutation of that agent's `pending` and `in_flight`
//! sets is serialized. Sessions, the API, and timers all talk to the actor
//! through messages; the actor alone touches the store for queue-related
//! transitions. Waiter deadlines are handled by the actor itself selecting
//! on the earliest in-flight deadline, not by per-command tasks.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rsm_core::policy::{CommandPolicy, Rejection};
use rsm_core::protocol::Frame;
use rsm_core::types::CommandStatus;
use rsm_storage::{NewCommand, StorageError, TransitionPatch};

use crate::SharedStore;

/// Outbound traffic for one session socket. The session's write task is the
/// only writer; the engine reaches the socket through this channel.
#[derive(Debug)]
pub enum Outbound {
    Frame(Frame),
    Close { code: u16, reason: String },
}

/// Engine-side handle to a live session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub conn_id: u64,
    pub frames: mpsc::Sender<Outbound>,
}

#[derive(Debug, Default)]
pub struct EngineCounters {
    /// Results or errors that arrived after their command was already
    /// resolved (usually by timeout) and were dropped.
    pub late_result_drops: AtomicU64,
    /// Inbound messages that failed to parse or had an unexpected type.
    pub frames_dropped: AtomicU64,
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("{0}")]
    Rejected(Rejection),
    #[error("queue full (limit {limit})")]
    QueueFull { limit: usize },
    #[error("duplicate command id: {0}")]
    Conflict(String),
    #[error("store error: {0}")]
    Store(StorageError),
    #[error("queue engine unavailable")]
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    pub command_id: String,
    pub agent_id: String,
    pub status: CommandStatus,
    pub effective_timeout: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyDispatched,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub command_id: String,
    pub command: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub agent_id: String,
    pub online: bool,
    pub pending: Vec<PendingEntry>,
    pub in_flight: Vec<String>,
}

enum QueueMsg {
    Submit {
        spec: SubmitSpec,
        resp: oneshot::Sender<Result<SubmitReceipt, SubmitError>>,
    },
    Bind {
        session: SessionHandle,
    },
    Unbind {
        conn_id: u64,
        resp: oneshot::Sender<bool>,
    },
    AgentFrame {
        frame: Frame,
    },
    Cancel {
        command_id: String,
        resp: oneshot::Sender<CancelOutcome>,
    },
    Snapshot {
        resp: oneshot::Sender<QueueSnapshot>,
    },
    Shutdown,
}

struct SubmitSpec {
    command_id: String,
    command: String,
    timeout: u32,
    priority: i32,
}

pub struct QueueEngine {
    store: SharedStore,
    policy: CommandPolicy,
    max_queue_size: usize,
    grace: Duration,
    inboxes: RwLock<HashMap<String, mpsc::Sender<QueueMsg>>>,
    counters: Arc<EngineCounters>,
    conn_counter: AtomicU64,
}

impl QueueEngine {
    pub fn new(
        store: SharedStore,
        policy: CommandPolicy,
        max_queue_size: usize,
        grace: Duration,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            store,
            policy,
            max_queue_size,
            grace,
            inboxes: RwLock::new(HashMap::new()),
            counters,
            conn_counter: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn counters(&self) -> &Arc<EngineCounters> {
        &self.counters
    }

    pub fn next_conn_id(&self) -> u64 {
        self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Validate and enqueue a command. Rejections are synchronous and never
    /// touch the store.
    pub async fn submit(
        &self,
        agent_id: &str,
        command: &str,
        timeout: Option<u32>,
        priority: i32,
    ) -> Result<SubmitReceipt, SubmitError> {
        self.policy.validate(command).map_err(SubmitError::Rejected)?;
        let spec = SubmitSpec {
            command_id: Uuid::new_v4().to_string(),
            command: command.to_string(),
            timeout: self.policy.clamp_timeout(timeout),
            priority,
        };
        let (resp_tx, resp_rx) = oneshot::channel();
        self.send(agent_id, QueueMsg::Submit { spec, resp: resp_tx })
            .await?;
        resp_rx.await.map_err(|_| SubmitError::Unavailable)?
    }

    /// Bind a freshly activated session. Any previous session for the same
    /// agent is closed with code 4000 first.
    pub async fn bind(&self, agent_id: &str, session: SessionHandle) {
        let _ = self.send(agent_id, QueueMsg::Bind { session }).await;
    }

    /// Unbind after a session closed. Returns whether the given connection
    /// was still the bound one (a superseded session returns false).
    pub async fn unbind(&self, agent_id: &str, conn_id: u64) -> bool {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .send(agent_id, QueueMsg::Unbind { conn_id, resp: resp_tx })
            .await
            .is_err()
        {
            return false;
        }
        resp_rx.await.unwrap_or(false)
    }

    /// Route a `result` or `error` frame from the agent to its queue.
    pub async fn agent_frame(&self, agent_id: &str, frame: Frame) {
        let _ = self.send(agent_id, QueueMsg::AgentFrame { frame }).await;
    }

    pub async fn cancel(&self, agent_id: &str, command_id: &str) -> CancelOutcome {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .send(
                agent_id,
                QueueMsg::Cancel {
                    command_id: command_id.to_string(),
                    resp: resp_tx,
                },
            )
            .await
            .is_err()
        {
            return CancelOutcome::NotFound;
        }
        resp_rx.await.unwrap_or(CancelOutcome::NotFound)
    }

    pub async fn snapshot(&self, agent_id: &str) -> Option<QueueSnapshot> {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .send(agent_id, QueueMsg::Snapshot { resp: resp_tx })
            .await
            .is_err()
        {
            return None;
        }
        resp_rx.await.ok()
    }

    /// Live overlay for every agent the engine has touched this run.
    pub async fn overlay(&self) -> HashMap<String, QueueSnapshot> {
        let ids: Vec<String> = self.inboxes.read().await.keys().cloned().collect();
        let mut out = HashMap::new();
        for agent_id in ids {
            if let Some(snapshot) = self.snapshot(&agent_id).await {
                out.insert(agent_id, snapshot);
            }
        }
        out
    }

    pub async fn online_agents(&self) -> usize {
        self.overlay()
            .await
            .values()
            .filter(|snapshot| snapshot.online)
            .count()
    }

    /// Graceful shutdown: close every bound session with code 1001.
    pub async fn shutdown(&self) {
        let inboxes: Vec<mpsc::Sender<QueueMsg>> =
            self.inboxes.read().await.values().cloned().collect();
        for inbox in inboxes {
            let _ = inbox.send(QueueMsg::Shutdown).await;
        }
    }

    async fn send(&self, agent_id: &str, msg: QueueMsg) -> Result<(), SubmitError> {
        let inbox = self.inbox(agent_id).await;
        inbox.send(msg).await.map_err(|_| SubmitError::Unavailable)
    }

    async fn inbox(&self, agent_id: &str) -> mpsc::Sender<QueueMsg> {
        if let Some(tx) = self.inboxes.read().await.get(agent_id) {
            return tx.clone();
        }
        let mut map = self.inboxes.write().await;
        if let Some(tx) = map.get(agent_id) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(64);
        let actor = AgentQueue::new(
            agent_id.to_string(),
            self.store.clone(),
            self.max_queue_size,
            self.grace,
            self.counters.clone(),
        );
        tokio::spawn(actor.run(rx));
        map.insert(agent_id.to_string(), tx.clone());
        tx
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
}

#[derive(Debug, Clone)]
struct QueuedCommand {
    command_id: String,
    command: String,
    timeout: u32,
    priority: i32,
    created_at: DateTime<Utc>,
}

struct InFlight {
    deadline: Instant,
}

const IDLE_WAKE: Duration = Duration::from_secs(600);

struct AgentQueue {
    agent_id: String,
    store: SharedStore,
    max_queue_size: usize,
    grace: Duration,
    counters: Arc<EngineCounters>,
    pending: BTreeMap<QueueKey, QueuedCommand>,
    in_flight: HashMap<String, InFlight>,
    session: Option<SessionHandle>,
    seq: u64,
}

impl AgentQueue {
    fn new(
        agent_id: String,
        store: SharedStore,
        max_queue_size: usize,
        grace: Duration,
        counters: Arc<EngineCounters>,
    ) -> Self {
        Self {
            agent_id,
            store,
            max_queue_size,
            grace,
            counters,
            pending: BTreeMap::new(),
            in_flight: HashMap::new(),
            session: None,
            seq: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<QueueMsg>) {
        // Seed the in-memory queue from the store so pending commands left
        // over from a previous coordinator run are visible immediately.
        self.reload_pending().await;
        loop {
            let wake = self.next_wake();
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(wake), if !self.in_flight.is_empty() => {
                    self.expire_due().await;
                }
            }
        }
    }

    fn next_wake(&self) -> Instant {
        self.in_flight
            .values()
            .map(|entry| entry.deadline)
            .min()
            .unwrap_or_else(|| Instant::now() + IDLE_WAKE)
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn holds(&self, command_id: &str) -> bool {
        self.in_flight.contains_key(command_id)
            || self.pending.values().any(|cmd| cmd.command_id == command_id)
    }

    async fn handle(&mut self, msg: QueueMsg) {
        match msg {
            QueueMsg::Submit { spec, resp } => {
                let result = self.submit(spec).await;
                let _ = resp.send(result);
                self.try_dispatch().await;
            }
            QueueMsg::Bind { session } => {
                self.bind(session).await;
                self.try_dispatch().await;
            }
            QueueMsg::Unbind { conn_id, resp } => {
                let was_bound = self.unbind(conn_id).await;
                let _ = resp.send(was_bound);
            }
            QueueMsg::AgentFrame { frame } => {
                self.agent_frame(frame).await;
                self.try_dispatch().await;
            }
            QueueMsg::Cancel { command_id, resp } => {
                let outcome = self.cancel(&command_id).await;
                let _ = resp.send(outcome);
            }
            QueueMsg::Snapshot { resp } => {
                let _ = resp.send(self.snapshot());
            }
            QueueMsg::Shutdown => {
                if let Some(session) = self.session.take() {
                    let _ = session
                        .frames
                        .send(Outbound::Close {
                            code: 1001,
                            reason: "shutdown".to_string(),
                        })
                        .await;
                }
            }
        }
    }

    async fn submit(&mut self, spec: SubmitSpec) -> Result<SubmitReceipt, SubmitError> {
        if self.pending.len() >= self.max_queue_size {
            return Err(SubmitError::QueueFull {
                limit: self.max_queue_size,
            });
        }

        let record = {
            let store = self.store.lock().await;
            if let Err(err) = store.upsert_agent(&self.agent_id, None) {
                return Err(SubmitError::Store(err));
            }
            store.insert_command(&NewCommand {
                command_id: spec.command_id.clone(),
                agent_id: self.agent_id.clone(),
                command: spec.command.clone(),
                timeout_seconds: spec.timeout,
                priority: spec.priority,
            })
        };
        let record = match record {
            Ok(record) => record,
            Err(StorageError::DuplicateCommand(id)) => return Err(SubmitError::Conflict(id)),
            Err(err) => return Err(SubmitError::Store(err)),
        };

        let key = QueueKey {
            priority: Reverse(spec.priority),
            seq: self.next_seq(),
        };
        self.pending.insert(
            key,
            QueuedCommand {
                command_id: record.command_id.clone(),
                command: spec.command,
                timeout: spec.timeout,
                priority: spec.priority,
                created_at: record.created_at,
            },
        );
        info!(
            event = "command_queued",
            agent_id = %self.agent_id,
            command_id = %record.command_id,
            priority = spec.priority
        );
        Ok(SubmitReceipt {
            command_id: record.command_id,
            agent_id: self.agent_id.clone(),
            status: CommandStatus::Pending,
            effective_timeout: spec.timeout,
        })
    }

    async fn bind(&mut self, session: SessionHandle) {
        if let Some(old) = self.session.take() {
            info!(
                event = "session_superseded",
                agent_id = %self.agent_id,
                old_conn = old.conn_id,
                new_conn = session.conn_id
            );
            let _ = old
                .frames
                .send(Outbound::Close {
                    code: 4000,
                    reason: "superseded".to_string(),
                })
                .await;
            // Whatever was in flight on the old socket fails fast; the new
            // session starts with a clean slate.
            self.fail_in_flight("session lost").await;
        }
        self.session = Some(session);
        self.reload_pending().await;
        info!(event = "session_bound", agent_id = %self.agent_id);
    }

    async fn unbind(&mut self, conn_id: u64) -> bool {
        let is_current = self
            .session
            .as_ref()
            .is_some_and(|session| session.conn_id == conn_id);
        if !is_current {
            return false;
        }
        self.session = None;
        self.fail_in_flight("session lost").await;
        info!(event = "session_unbound", agent_id = %self.agent_id);
        true
    }

    async fn fail_in_flight(&mut self, reason: &str) {
        let ids: Vec<String> = self.in_flight.drain().map(|(id, _)| id).collect();
        for command_id in ids {
            let result = {
                let store = self.store.lock().await;
                store.transition(
                    &command_id,
                    &[CommandStatus::Sent, CommandStatus::Executing],
                    CommandStatus::Failed,
                    &TransitionPatch {
                        completed_at: Some(Utc::now()),
                        error_message: Some(reason.to_string()),
                        ..TransitionPatch::default()
                    },
                )
            };
            match result {
                Ok(true) => {
                    warn!(event = "command_failed", agent_id = %self.agent_id, command_id = %command_id, reason)
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(event = "store_error", agent_id = %self.agent_id, error = %err)
                }
            }
        }
    }

    async fn reload_pending(&mut self) {
        let rows = {
            let store = self.store.lock().await;
            store.pending_for_agent(&self.agent_id)
        };
        let rows = match rows {
            Ok(rows) => rows,
            Err(err) => {
                warn!(event = "store_error", agent_id = %self.agent_id, error = %err);
                return;
            }
        };
        for record in rows {
            if self.holds(&record.command_id) {
                continue;
            }
            let key = QueueKey {
                priority: Reverse(record.priority),
                seq: self.next_seq(),
            };
            self.pending.insert(
                key,
                QueuedCommand {
                    command_id: record.command_id,
                    command: record.command,
                    timeout: record.timeout_seconds,
                    priority: record.priority,
                    created_at: record.created_at,
                },
            );
        }
    }

    /// Drain pending commands onto the bound session, highest priority
    /// first, FIFO within a priority.
    async fn try_dispatch(&mut self) {
        loop {
            let Some(session) = self.session.clone() else {
                return;
            };
            let Some((key, cmd)) = self.pending.pop_first() else {
                return;
            };

            let fired = {
                let store = self.store.lock().await;
                store.transition(
                    &cmd.command_id,
                    &[CommandStatus::Pending],
                    CommandStatus::Sent,
                    &TransitionPatch {
                        sent_at: Some(Utc::now()),
                        ..TransitionPatch::default()
                    },
                )
            };
            let fired = match fired {
                Ok(fired) => fired,
                Err(err) => {
                    // Store trouble pauses dispatch; the command stays
                    // queued and a later submit or bind retries.
                    warn!(event = "store_error", agent_id = %self.agent_id, error = %err);
                    self.pending.insert(key, cmd);
                    return;
                }
            };
            if !fired {
                // Lost the CAS, most likely to a concurrent cancel.
                debug!(event = "dispatch_skipped", command_id = %cmd.command_id);
                continue;
            }

            let frame = Frame::Command {
                command_id: cmd.command_id.clone(),
                command: cmd.command.clone(),
                timeout: cmd.timeout,
                priority: cmd.priority,
            };
            if session.frames.send(Outbound::Frame(frame)).await.is_err() {
                // Writer is gone; revert to pending and wait for a rebind.
                let revert = {
                    let store = self.store.lock().await;
                    store.transition(
                        &cmd.command_id,
                        &[CommandStatus::Sent],
                        CommandStatus::Pending,
                        &TransitionPatch {
                            clear_sent_at: true,
                            ..TransitionPatch::default()
                        },
                    )
                };
                if let Err(err) = revert {
                    warn!(event = "store_error", agent_id = %self.agent_id, error = %err);
                }
                self.pending.insert(key, cmd);
                self.session = None;
                return;
            }

            let deadline =
                Instant::now() + Duration::from_secs(u64::from(cmd.timeout)) + self.grace;
            self.in_flight
                .insert(cmd.command_id.clone(), InFlight { deadline });
            info!(
                event = "command_sent",
                agent_id = %self.agent_id,
                command_id = %cmd.command_id
            );
        }
    }

    async fn agent_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Result {
                command_id,
                stdout,
                stderr,
                exit_code,
                execution_time,
            } => {
                if self.in_flight.remove(&command_id).is_none() {
                    self.counters.late_result_drops.fetch_add(1, Ordering::Relaxed);
                    warn!(event = "late_result_drop", agent_id = %self.agent_id, command_id = %command_id);
                    return;
                }
                let result = {
                    let store = self.store.lock().await;
                    store.transition(
                        &command_id,
                        &[CommandStatus::Sent, CommandStatus::Executing],
                        CommandStatus::Completed,
                        &TransitionPatch {
                            completed_at: Some(Utc::now()),
                            stdout: Some(stdout),
                            stderr: Some(stderr),
                            exit_code: Some(exit_code),
                            execution_time: Some(execution_time),
                            ..TransitionPatch::default()
                        },
                    )
                };
                match result {
                    Ok(true) => {
                        info!(event = "command_completed", agent_id = %self.agent_id, command_id = %command_id, exit_code)
                    }
                    Ok(false) => {
                        warn!(event = "result_for_terminal", agent_id = %self.agent_id, command_id = %command_id)
                    }
                    Err(err) => {
                        warn!(event = "store_error", agent_id = %self.agent_id, error = %err)
                    }
                }
            }
            Frame::Error { command_id, error } => {
                let Some(command_id) = command_id else {
                    warn!(event = "agent_error", agent_id = %self.agent_id, error = %error);
                    return;
                };
                if self.in_flight.remove(&command_id).is_none() {
                    self.counters.late_result_drops.fetch_add(1, Ordering::Relaxed);
                    warn!(event = "late_result_drop", agent_id = %self.agent_id, command_id = %command_id);
                    return;
                }
                let result = {
                    let store = self.store.lock().await;
                    store.transition(
                        &command_id,
                        &[CommandStatus::Sent, CommandStatus::Executing],
                        CommandStatus::Failed,
                        &TransitionPatch {
                            completed_at: Some(Utc::now()),
                            error_message: Some(error),
                            ..TransitionPatch::default()
                        },
                    )
                };
                match result {
                    Ok(true) => {
                        warn!(event = "command_failed", agent_id = %self.agent_id, command_id = %command_id, reason = "agent error")
                    }
                    Ok(false) => {}
                    Err(err) => {
                        warn!(event = "store_error", agent_id = %self.agent_id, error = %err)
                    }
                }
            }
            other => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(event = "unexpected_frame", agent_id = %self.agent_id, frame = ?other);
            }
        }
    }

    async fn cancel(&mut self, command_id: &str) -> CancelOutcome {
        let key = self
            .pending
            .iter()
            .find(|(_, cmd)| cmd.command_id == command_id)
            .map(|(key, _)| key.clone());
        if let Some(key) = key {
            self.pending.remove(&key);
            let result = {
                let store = self.store.lock().await;
                store.transition(
                    command_id,
                    &[CommandStatus::Pending],
                    CommandStatus::Cancelled,
                    &TransitionPatch {
                        completed_at: Some(Utc::now()),
                        ..TransitionPatch::default()
                    },
                )
            };
            match result {
                Ok(true) => {
                    info!(event = "command_cancelled", agent_id = %self.agent_id, command_id = %command_id);
                    return CancelOutcome::Cancelled;
                }
                Ok(false) => return CancelOutcome::NotFound,
                Err(err) => {
                    warn!(event = "store_error", agent_id = %self.agent_id, error = %err);
                    return CancelOutcome::NotFound;
                }
            }
        }
        if self.in_flight.contains_key(command_id) {
            return CancelOutcome::AlreadyDispatched;
        }
        CancelOutcome::NotFound
    }

    async fn expire_due(&mut self) {
        let now = Instant::now();
        let due: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for command_id in due {
            self.in_flight.remove(&command_id);
            let result = {
                let store = self.store.lock().await;
                store.transition(
                    &command_id,
                    &[CommandStatus::Sent, CommandStatus::Executing],
                    CommandStatus::Timeout,
                    &TransitionPatch {
                        completed_at: Some(Utc::now()),
                        error_message: Some("deadline exceeded".to_string()),
                        ..TransitionPatch::default()
                    },
                )
            };
            match result {
                Ok(true) => {
                    warn!(event = "command_timeout", agent_id = %self.agent_id, command_id = %command_id)
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(event = "store_error", agent_id = %self.agent_id, error = %err)
                }
            }
            // Best-effort hint; the agent enforces its own deadline too.
            if let Some(session) = &self.session {
                let _ = session
                    .frames
                    .send(Outbound::Frame(Frame::Cancel {
                        command_id: command_id.clone(),
                    }))
                    .await;
            }
        }
    }

    fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            agent_id: self.agent_id.clone(),
            online: self.session.is_some(),
            pending: self
                .pending
                .values()
                .map(|cmd| PendingEntry {
                    command_id: cmd.command_id.clone(),
                    command: cmd.command.clone(),
                    priority: cmd.priority,
                    created_at: cmd.created_at,
                })
                .collect(),
            in_flight: self.in_flight.keys().cloned().collect(),
        }
    }
}
