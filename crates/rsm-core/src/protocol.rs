//! Wire frames exchanged between the coordinator and an agent.
//!
//! Frames are single JSON objects with a mandatory `type` tag. The set is
//! closed: anything that does not decode into [`Frame`] is a soft error the
//! receiver logs and drops, never a reason to tear down the session.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frames larger than this are dropped without parsing.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {size} bytes")]
    TooLarge { size: usize },
    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Policy summary echoed to the agent in the `welcome` frame so both sides
/// can log a mismatch between local and coordinator policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEcho {
    pub max_length: usize,
    pub allow_list_enabled: bool,
    pub allow_shell_operators: bool,
    pub max_timeout_seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// S -> A: execute a command.
    Command {
        command_id: String,
        command: String,
        timeout: u32,
        #[serde(default)]
        priority: i32,
    },
    /// A -> S: a command finished (including agent-side deadline kills,
    /// which report `exit_code = -1`).
    Result {
        command_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        exit_code: i64,
        #[serde(default)]
        execution_time: f64,
    },
    /// A -> S: a command could not run (local validation or spawn failure).
    /// `command_id` is absent for session-level errors.
    Error {
        #[serde(default)]
        command_id: Option<String>,
        error: String,
    },
    Ping,
    Pong,
    /// S -> A: sent once when the session activates.
    Welcome { agent_id: String, policy: PolicyEcho },
    /// S -> A: best-effort hint after a coordinator-side timeout; the agent
    /// kills the named command if it is still running.
    Cancel { command_id: String },
}

impl Frame {
    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge { size: data.len() });
        }
        Ok(serde_json::from_slice(data)?)
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_round_trip() {
        let frame = Frame::Command {
            command_id: "cmd-1".to_string(),
            command: "whoami".to_string(),
            timeout: 5,
            priority: 0,
        };
        let encoded = frame.encode();
        assert!(encoded.contains("\"type\":\"command\""));
        let decoded = Frame::decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn result_frame_defaults() {
        let decoded =
            Frame::decode(br#"{"type":"result","command_id":"cmd-2","exit_code":0}"#).unwrap();
        match decoded {
            Frame::Result {
                stdout,
                stderr,
                exit_code,
                execution_time,
                ..
            } => {
                assert_eq!(stdout, "");
                assert_eq!(stderr, "");
                assert_eq!(exit_code, 0);
                assert_eq!(execution_time, 0.0);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Frame::decode(br#"{"type":"shutdown_now"}"#).is_err());
        assert!(Frame::decode(b"not json").is_err());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let huge = vec![b'a'; MAX_FRAME_BYTES + 1];
        assert!(matches!(
            Frame::decode(&huge),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn ping_pong_encode() {
        assert_eq!(Frame::Ping.encode(), r#"{"type":"ping"}"#);
        assert_eq!(Frame::Pong.encode(), r#"{"type":"pong"}"#);
    }
}
