//! Session tests over real sockets: token auth, welcome, keep-alive, and
//! supersession close codes.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use rsm_core::protocol::Frame;
use rsm_core::tokens::TokenMap;
use rsm_core::types::CommandStatus;
use rsm_server::config::ServerConfig;
use rsm_server::{api, build_state, AppState};
use rsm_storage::Store;

async fn start_server(ping_interval: Duration) -> (AppState, SocketAddr) {
    let config = ServerConfig {
        ping_interval,
        grace: Duration::from_secs(1),
        ..ServerConfig::default()
    };
    let store = Store::open_in_memory().expect("open store");
    let tokens = TokenMap::parse("a1:tok-one").expect("tokens");
    let state = build_state(config, store, tokens);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = api::router(state.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (state, addr)
}

async fn expect_close_code(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
    expected: u16,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        assert!(
            tokio::time::Instant::now() < deadline,
            "no close frame with code {expected}"
        );
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Close(Some(frame))))) => {
                assert_eq!(u16::from(frame.code), expected);
                return;
            }
            Ok(Some(Ok(_))) => continue,
            Ok(Some(Err(_))) | Ok(None) => panic!("socket dropped without close {expected}"),
            Err(_) => panic!("timed out waiting for close {expected}"),
        }
    }
}

async fn next_frame(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Frame {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return Frame::decode(text.as_bytes()).expect("frame")
            }
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a text frame, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn invalid_token_closes_with_policy_violation() {
    let (_state, addr) = start_server(Duration::from_secs(30)).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token=wrong"))
        .await
        .expect("upgrade succeeds before auth close");
    expect_close_code(&mut ws, 1008).await;
}

#[tokio::test]
async fn missing_token_is_rejected_before_upgrade() {
    let (_state, addr) = start_server(Duration::from_secs(30)).await;
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
}

#[tokio::test]
async fn welcome_then_command_round_trip() {
    let (state, addr) = start_server(Duration::from_secs(30)).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token=tok-one"))
        .await
        .expect("connect");

    match next_frame(&mut ws).await {
        Frame::Welcome { agent_id, policy } => {
            assert_eq!(agent_id, "a1");
            assert_eq!(policy.max_timeout_seconds, 30);
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    // The agent shows online once the session is bound.
    let agent = {
        let store = state.store.lock().await;
        store.get_agent("a1").expect("query").expect("row")
    };
    assert_eq!(agent.status, rsm_core::types::AgentStatus::Online);

    let receipt = state
        .engine
        .submit("a1", "echo hi", Some(5), 0)
        .await
        .expect("submit");
    let (command_id, command, timeout) = match next_frame(&mut ws).await {
        Frame::Command {
            command_id,
            command,
            timeout,
            ..
        } => (command_id, command, timeout),
        other => panic!("expected command, got {other:?}"),
    };
    assert_eq!(command_id, receipt.command_id);
    assert_eq!(command, "echo hi");
    assert_eq!(timeout, 5);

    let result = Frame::Result {
        command_id: command_id.clone(),
        stdout: "hi\n".to_string(),
        stderr: String::new(),
        exit_code: 0,
        execution_time: 0.01,
    };
    ws.send(Message::Text(result.encode())).await.expect("send");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = {
            let store = state.store.lock().await;
            store.get_command(&command_id).expect("row")
        };
        if record.status == CommandStatus::Completed {
            assert_eq!(record.stdout.as_deref(), Some("hi\n"));
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "result never landed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // Application-level ping gets a pong.
    ws.send(Message::Text(Frame::Ping.encode())).await.expect("send");
    loop {
        match next_frame(&mut ws).await {
            Frame::Pong => break,
            Frame::Ping => continue,
            other => panic!("expected pong, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn second_socket_supersedes_first() {
    let (state, addr) = start_server(Duration::from_secs(30)).await;

    let (mut first, _) = connect_async(format!("ws://{addr}/ws?token=tok-one"))
        .await
        .expect("first connect");
    match next_frame(&mut first).await {
        Frame::Welcome { .. } => {}
        other => panic!("expected welcome, got {other:?}"),
    }

    let (mut second, _) = connect_async(format!("ws://{addr}/ws?token=tok-one"))
        .await
        .expect("second connect");
    match next_frame(&mut second).await {
        Frame::Welcome { .. } => {}
        other => panic!("expected welcome, got {other:?}"),
    }

    expect_close_code(&mut first, 4000).await;

    // Exactly one delivery, on the surviving session.
    let receipt = state
        .engine
        .submit("a1", "echo once", None, 0)
        .await
        .expect("submit");
    match next_frame(&mut second).await {
        Frame::Command { command_id, .. } => assert_eq!(command_id, receipt.command_id),
        other => panic!("expected command, got {other:?}"),
    }
}

#[tokio::test]
async fn silent_agent_loses_liveness() {
    let (_state, addr) = start_server(Duration::from_millis(200)).await;
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?token=tok-one"))
        .await
        .expect("connect");
    // Read frames without ever answering the pings; the server closes with
    // 4001 once more than two intervals pass in silence.
    expect_close_code(&mut ws, 4001).await;
}
