//! End-to-end queue engine scenarios, driven through channel-backed fake
//! sessions so no sockets are involved.

use std::time::Duration;

use tokio::sync::mpsc;

use rsm_core::policy::Rejection;
use rsm_core::protocol::Frame;
use rsm_core::tokens::TokenMap;
use rsm_core::types::{CommandRecord, CommandStatus};
use rsm_server::config::ServerConfig;
use rsm_server::{build_state, AppState, CancelOutcome, Outbound, SessionHandle, SubmitError};
use rsm_storage::{CommandFilter, Store};

fn test_state(grace_secs: u64, max_queue_size: usize) -> AppState {
    let config = ServerConfig {
        grace: Duration::from_secs(grace_secs),
        max_queue_size,
        ..ServerConfig::default()
    };
    let store = Store::open_in_memory().expect("open store");
    let tokens = TokenMap::parse("a1:t1,a2:t2,a3:t3,a4:t4").expect("tokens");
    build_state(config, store, tokens)
}

fn fake_session(state: &AppState) -> (SessionHandle, mpsc::Receiver<Outbound>) {
    let (tx, rx) = mpsc::channel(64);
    (
        SessionHandle {
            conn_id: state.engine.next_conn_id(),
            frames: tx,
        },
        rx,
    )
}

async fn next_command_frame(rx: &mut mpsc::Receiver<Outbound>) -> (String, String) {
    let outbound = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a command frame")
        .expect("session channel closed");
    match outbound {
        Outbound::Frame(Frame::Command {
            command_id,
            command,
            ..
        }) => (command_id, command),
        other => panic!("expected a command frame, got {other:?}"),
    }
}

async fn wait_for_status(
    state: &AppState,
    command_id: &str,
    status: CommandStatus,
) -> CommandRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = {
            let store = state.store.lock().await;
            store.get_command(command_id)
        };
        if let Ok(record) = record {
            if record.status == status {
                return record;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("command {command_id} never reached {status}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn simple_completion_round_trip() {
    let state = test_state(5, 100);
    let (session, mut rx) = fake_session(&state);
    state.engine.bind("a1", session).await;

    let receipt = state
        .engine
        .submit("a1", "whoami", Some(5), 0)
        .await
        .expect("submit");
    assert_eq!(receipt.status, CommandStatus::Pending);
    assert_eq!(receipt.effective_timeout, 5);

    let (command_id, command) = next_command_frame(&mut rx).await;
    assert_eq!(command_id, receipt.command_id);
    assert_eq!(command, "whoami");

    tokio::time::sleep(Duration::from_millis(20)).await;
    state
        .engine
        .agent_frame(
            "a1",
            Frame::Result {
                command_id: command_id.clone(),
                stdout: "remoteshell\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                execution_time: 0.02,
            },
        )
        .await;

    let record = wait_for_status(&state, &command_id, CommandStatus::Completed).await;
    assert_eq!(record.stdout.as_deref(), Some("remoteshell\n"));
    assert_eq!(record.stderr.as_deref(), Some(""));
    assert_eq!(record.exit_code, Some(0));
    assert_eq!(record.execution_time, Some(0.02));
    assert!(record.sent_at.expect("sent_at") < record.completed_at.expect("completed_at"));

    // History returns exactly this row.
    let history = {
        let store = state.store.lock().await;
        store
            .list_commands(&CommandFilter {
                agent_id: Some("a1".to_string()),
                ..CommandFilter::default()
            })
            .expect("list")
    };
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].command_id, command_id);
}

#[tokio::test]
async fn offline_queue_drains_in_order() {
    let state = test_state(5, 100);

    let mut ids = Vec::new();
    for n in 1..=3 {
        let receipt = state
            .engine
            .submit("a2", &format!("echo {n}"), Some(5), 0)
            .await
            .expect("submit");
        assert_eq!(receipt.status, CommandStatus::Pending);
        ids.push(receipt.command_id);
    }

    let (session, mut rx) = fake_session(&state);
    state.engine.bind("a2", session).await;

    for (n, expected_id) in ids.iter().enumerate() {
        let (command_id, command) = next_command_frame(&mut rx).await;
        assert_eq!(&command_id, expected_id, "dispatch order broke at {n}");
        assert_eq!(command, format!("echo {}", n + 1));
        state
            .engine
            .agent_frame(
                "a2",
                Frame::Result {
                    command_id: command_id.clone(),
                    stdout: format!("{}\n", n + 1),
                    stderr: String::new(),
                    exit_code: 0,
                    execution_time: 0.01,
                },
            )
            .await;
    }

    for (n, id) in ids.iter().enumerate() {
        let record = wait_for_status(&state, id, CommandStatus::Completed).await;
        assert_eq!(record.stdout.as_deref(), Some(format!("{}\n", n + 1).as_str()));
        assert!(record.sent_at.is_some());
    }
}

#[tokio::test]
async fn priority_overrides_fifo() {
    let state = test_state(5, 100);

    let c1 = state.engine.submit("a3", "echo c1", None, 0).await.unwrap();
    let c2 = state.engine.submit("a3", "echo c2", None, 0).await.unwrap();
    let c3 = state.engine.submit("a3", "echo c3", None, 10).await.unwrap();
    let c4 = state.engine.submit("a3", "echo c4", None, 0).await.unwrap();

    let (session, mut rx) = fake_session(&state);
    state.engine.bind("a3", session).await;

    let expected = [&c3.command_id, &c1.command_id, &c2.command_id, &c4.command_id];
    for expected_id in expected {
        let (command_id, _) = next_command_frame(&mut rx).await;
        assert_eq!(&command_id, expected_id);
    }
}

#[tokio::test]
async fn timeout_beats_late_result() {
    let state = test_state(1, 100);
    let (session, mut rx) = fake_session(&state);
    state.engine.bind("a1", session).await;

    let receipt = state
        .engine
        .submit("a1", "sleep 60", Some(1), 0)
        .await
        .expect("submit");
    let (command_id, _) = next_command_frame(&mut rx).await;
    assert_eq!(command_id, receipt.command_id);

    // No reply: the waiter deadline (timeout + grace = 2s) is authoritative.
    let record = wait_for_status(&state, &command_id, CommandStatus::Timeout).await;
    assert_eq!(record.error_message.as_deref(), Some("deadline exceeded"));

    // The agent gets a best-effort cancel hint.
    let hint = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("expected cancel hint")
        .expect("session channel closed");
    match hint {
        Outbound::Frame(Frame::Cancel { command_id: hinted }) => assert_eq!(hinted, command_id),
        other => panic!("expected a cancel frame, got {other:?}"),
    }

    // A late result is dropped and does not rewrite the terminal state.
    state
        .engine
        .agent_frame(
            "a1",
            Frame::Result {
                command_id: command_id.clone(),
                stdout: "too late\n".to_string(),
                stderr: String::new(),
                exit_code: 0,
                execution_time: 60.0,
            },
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = {
        let store = state.store.lock().await;
        store.get_command(&command_id).expect("row")
    };
    assert_eq!(record.status, CommandStatus::Timeout);
    assert!(record.stdout.is_none());
    assert!(
        state
            .counters
            .late_result_drops
            .load(std::sync::atomic::Ordering::Relaxed)
            >= 1
    );
}

#[tokio::test]
async fn validation_rejects_without_store_write() {
    let state = test_state(5, 100);

    let denied = state.engine.submit("a1", "rm -rf /", None, 0).await;
    assert!(matches!(
        denied,
        Err(SubmitError::Rejected(Rejection::Denied(_)))
    ));

    let operators = state
        .engine
        .submit("a1", "ls; cat /etc/passwd", None, 0)
        .await;
    assert!(matches!(
        operators,
        Err(SubmitError::Rejected(Rejection::ShellOperatorForbidden(_)))
    ));

    let rows = {
        let store = state.store.lock().await;
        store.list_commands(&CommandFilter::default()).expect("list")
    };
    assert!(rows.is_empty(), "rejected submissions must not hit the store");
}

#[tokio::test]
async fn supersession_closes_older_session() {
    let state = test_state(5, 100);

    let (session_a, mut rx_a) = fake_session(&state);
    let conn_a = session_a.conn_id;
    state.engine.bind("a4", session_a).await;

    let (session_b, mut rx_b) = fake_session(&state);
    state.engine.bind("a4", session_b).await;

    let closed = tokio::time::timeout(Duration::from_secs(2), rx_a.recv())
        .await
        .expect("expected close on the old session")
        .expect("channel closed");
    match closed {
        Outbound::Close { code, reason } => {
            assert_eq!(code, 4000);
            assert_eq!(reason, "superseded");
        }
        other => panic!("expected close, got {other:?}"),
    }

    // The superseded connection is no longer the bound one.
    assert!(!state.engine.unbind("a4", conn_a).await);

    // A command submitted now reaches only the new session.
    let receipt = state.engine.submit("a4", "echo solo", None, 0).await.unwrap();
    let (command_id, _) = next_command_frame(&mut rx_b).await;
    assert_eq!(command_id, receipt.command_id);
}

#[tokio::test]
async fn cancel_only_works_while_pending() {
    let state = test_state(5, 100);

    // Pending: cancel succeeds and the agent never sees the command.
    let queued = state.engine.submit("a1", "echo later", None, 0).await.unwrap();
    assert_eq!(
        state.engine.cancel("a1", &queued.command_id).await,
        CancelOutcome::Cancelled
    );
    let record = wait_for_status(&state, &queued.command_id, CommandStatus::Cancelled).await;
    assert!(record.sent_at.is_none());

    let (session, mut rx) = fake_session(&state);
    state.engine.bind("a1", session).await;
    let nothing = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(nothing.is_err(), "cancelled command must never dispatch");

    // In flight: cancel is refused without side effects.
    let running = state.engine.submit("a1", "sleep 5", Some(5), 0).await.unwrap();
    let (command_id, _) = next_command_frame(&mut rx).await;
    assert_eq!(command_id, running.command_id);
    assert_eq!(
        state.engine.cancel("a1", &command_id).await,
        CancelOutcome::AlreadyDispatched
    );
    let record = {
        let store = state.store.lock().await;
        store.get_command(&command_id).expect("row")
    };
    assert_eq!(record.status, CommandStatus::Sent);

    // Unknown: not found.
    assert_eq!(
        state.engine.cancel("a1", "no-such-command").await,
        CancelOutcome::NotFound
    );
}

#[tokio::test]
async fn queue_cap_returns_queue_full() {
    let state = test_state(5, 2);
    state.engine.submit("a1", "echo 1", None, 0).await.unwrap();
    state.engine.submit("a1", "echo 2", None, 0).await.unwrap();
    let third = state.engine.submit("a1", "echo 3", None, 0).await;
    assert!(matches!(third, Err(SubmitError::QueueFull { limit: 2 })));
}

#[tokio::test]
async fn session_loss_fails_in_flight_and_keeps_pending() {
    let state = test_state(5, 100);
    let (session, mut rx) = fake_session(&state);
    let conn_id = session.conn_id;
    state.engine.bind("a1", session).await;

    let dispatched = state.engine.submit("a1", "sleep 30", Some(30), 0).await.unwrap();
    let (command_id, _) = next_command_frame(&mut rx).await;
    assert_eq!(command_id, dispatched.command_id);

    assert!(state.engine.unbind("a1", conn_id).await);
    let record = wait_for_status(&state, &command_id, CommandStatus::Failed).await;
    assert_eq!(record.error_message.as_deref(), Some("session lost"));

    // Submissions while offline stay pending for the next bind.
    let queued = state.engine.submit("a1", "echo next", None, 0).await.unwrap();
    let (session2, mut rx2) = fake_session(&state);
    state.engine.bind("a1", session2).await;
    let (next_id, _) = next_command_frame(&mut rx2).await;
    assert_eq!(next_id, queued.command_id);
}

#[tokio::test]
async fn dead_writer_reverts_command_to_pending() {
    let state = test_state(5, 100);
    let (session, rx) = fake_session(&state);
    drop(rx);
    state.engine.bind("a1", session).await;

    let receipt = state.engine.submit("a1", "echo hi", None, 0).await.unwrap();
    let record = wait_for_status(&state, &receipt.command_id, CommandStatus::Pending).await;
    assert!(record.sent_at.is_none(), "revert must clear sent_at");

    let snapshot = state.engine.snapshot("a1").await.expect("snapshot");
    assert!(!snapshot.online);
    assert_eq!(snapshot.pending.len(), 1);
}

#[tokio::test]
async fn store_and_memory_agree_on_pending() {
    let state = test_state(5, 100);

    let mut submitted = Vec::new();
    for (n, priority) in [(1, 0), (2, 5), (3, 0), (4, 2)] {
        let receipt = state
            .engine
            .submit("a2", &format!("echo {n}"), None, priority)
            .await
            .unwrap();
        submitted.push(receipt.command_id);
    }
    state.engine.cancel("a2", &submitted[2]).await;

    let snapshot = state.engine.snapshot("a2").await.expect("snapshot");
    let memory_ids: Vec<String> = snapshot
        .pending
        .iter()
        .map(|entry| entry.command_id.clone())
        .collect();
    let store_ids: Vec<String> = {
        let store = state.store.lock().await;
        store
            .pending_for_agent("a2")
            .expect("pending")
            .into_iter()
            .map(|record| record.command_id)
            .collect()
    };
    assert_eq!(memory_ids, store_ids);
    assert_eq!(memory_ids.len(), 3);
}
