//! Command and agent lifecycle records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a dispatched command.
///
/// `pending` commands sit in an agent's queue; `sent` and `executing` are
/// in flight on a live session; the remaining four states are terminal and
/// absorbing. The allowed transitions are enforced by the store's
/// compare-and-set, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Sent,
    Executing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl CommandStatus {
    pub const ALL: [CommandStatus; 7] = [
        CommandStatus::Pending,
        CommandStatus::Sent,
        CommandStatus::Executing,
        CommandStatus::Completed,
        CommandStatus::Failed,
        CommandStatus::Timeout,
        CommandStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Sent => "sent",
            CommandStatus::Executing => "executing",
            CommandStatus::Completed => "completed",
            CommandStatus::Failed => "failed",
            CommandStatus::Timeout => "timeout",
            CommandStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<CommandStatus> {
        Self::ALL.iter().copied().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CommandStatus::Completed
                | CommandStatus::Failed
                | CommandStatus::Timeout
                | CommandStatus::Cancelled
        )
    }
}

impl std::fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity of an agent as recorded in the store. `online` iff a live
/// session is currently bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(value: &str) -> Option<AgentStatus> {
        match value {
            "online" => Some(AgentStatus::Online),
            "offline" => Some(AgentStatus::Offline),
            _ => None,
        }
    }
}

/// Full lifecycle row for a single command, as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub command_id: String,
    pub agent_id: String,
    pub command: String,
    pub timeout_seconds: u32,
    pub priority: i32,
    pub status: CommandStatus,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
}

/// One managed agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    pub status: AgentStatus,
    pub first_seen: DateTime<Utc>,
    pub last_connected: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in CommandStatus::ALL {
            assert_eq!(CommandStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CommandStatus::parse("bogus"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!CommandStatus::Pending.is_terminal());
        assert!(!CommandStatus::Sent.is_terminal());
        assert!(!CommandStatus::Executing.is_terminal());
        assert!(CommandStatus::Completed.is_terminal());
        assert!(CommandStatus::Failed.is_terminal());
        assert!(CommandStatus::Timeout.is_terminal());
        assert!(CommandStatus::Cancelled.is_terminal());
    }
}
