//! Command validation policy.
//!
//! The same policy check runs on the coordinator at submission time and on
//! the agent before execution. `validate` is a pure function of the command
//! string and the policy, so both sides always agree for identical policy.

use serde::{Deserialize, Serialize};

use crate::protocol::PolicyEcho;

/// Dangerous patterns that are always blocked, regardless of configuration.
pub const DEFAULT_DENY_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "mkfs",
    "dd if=/dev/zero",
    "> /dev/sd",
    ":(){ :|:& };:",
    "chmod -r 777 /",
    "mv / /dev/null",
];

/// Built-in safe commands, used when the allow list is enabled but empty.
pub const DEFAULT_ALLOW_LIST: &[&str] = &[
    "ls", "pwd", "whoami", "hostname", "uptime", "df", "du", "free", "ps", "cat", "grep", "find",
    "echo", "date", "uname", "which",
];

const SHELL_OPERATORS: &[&str] = &[";", "&&", "||", "|", ">", "<", "`", "$(", "\n"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPolicy {
    pub max_length: usize,
    pub deny_patterns: Vec<String>,
    pub allow_list_enabled: bool,
    pub allow_list: Vec<String>,
    pub allow_shell_operators: bool,
    pub max_timeout_seconds: u32,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self {
            max_length: 1000,
            deny_patterns: DEFAULT_DENY_PATTERNS.iter().map(|p| p.to_string()).collect(),
            allow_list_enabled: false,
            allow_list: Vec::new(),
            allow_shell_operators: false,
            max_timeout_seconds: 30,
        }
    }
}

/// Why a command was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("empty command")]
    Empty,
    #[error("command exceeds maximum length ({0})")]
    TooLong(usize),
    #[error("command blocked by security policy: {0}")]
    Denied(String),
    #[error("command contains forbidden shell operator {0:?}")]
    ShellOperatorForbidden(&'static str),
    #[error("command not in allow list")]
    NotInAllowList,
}

impl Rejection {
    /// Stable machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Rejection::Empty => "empty",
            Rejection::TooLong(_) => "too_long",
            Rejection::Denied(_) => "denied",
            Rejection::ShellOperatorForbidden(_) => "shell_operator_forbidden",
            Rejection::NotInAllowList => "not_in_allow_list",
        }
    }
}

impl CommandPolicy {
    /// Validate a command string against this policy.
    ///
    /// Checks run in a fixed order: empty, length, deny list, shell
    /// operators, allow list. The deny list always wins over the allow list.
    pub fn validate(&self, command: &str) -> Result<(), Rejection> {
        let trimmed = command.trim();
        if trimmed.is_empty() {
            return Err(Rejection::Empty);
        }
        if command.len() > self.max_length {
            return Err(Rejection::TooLong(self.max_length));
        }

        let lower = command.to_lowercase();
        for pattern in &self.deny_patterns {
            if lower.contains(&pattern.to_lowercase()) {
                return Err(Rejection::Denied(pattern.clone()));
            }
        }

        if !self.allow_shell_operators {
            for op in SHELL_OPERATORS.iter().copied() {
                if command.contains(op) {
                    return Err(Rejection::ShellOperatorForbidden(op));
                }
            }
        }

        if self.allow_list_enabled {
            // First whitespace-separated token of the trimmed command.
            let base = trimmed.split_whitespace().next().unwrap_or_default();
            let allowed = if self.allow_list.is_empty() {
                DEFAULT_ALLOW_LIST.iter().any(|entry| *entry == base)
            } else {
                self.allow_list.iter().any(|entry| entry == base)
            };
            if !allowed {
                return Err(Rejection::NotInAllowList);
            }
        }

        Ok(())
    }

    /// Clamp a requested timeout to the policy ceiling. A missing or zero
    /// request gets the ceiling itself.
    pub fn clamp_timeout(&self, requested: Option<u32>) -> u32 {
        match requested {
            Some(secs) if secs > 0 => secs.min(self.max_timeout_seconds),
            _ => self.max_timeout_seconds,
        }
    }

    pub fn echo(&self) -> PolicyEcho {
        PolicyEcho {
            max_length: self.max_length,
            allow_list_enabled: self.allow_list_enabled,
            allow_shell_operators: self.allow_shell_operators,
            max_timeout_seconds: self.max_timeout_seconds,
        }
    }
}
