//! Agent authentication tokens.
//!
//! Tokens map one-to-one to agent identities via an explicit table parsed
//! from `agent_id:token` pairs. Lookups compare every entry in constant
//! time so a probe cannot learn token prefixes from response timing.
//! Token values must never appear in logs or error messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TokenParseError {
    #[error("malformed token entry at position {0} (expected agent_id:token)")]
    Malformed(usize),
    #[error("duplicate token for agents {0:?} and {1:?}")]
    DuplicateToken(String, String),
    #[error("duplicate agent id {0:?}")]
    DuplicateAgent(String),
}

/// Table of `(token, agent_id)` pairs.
#[derive(Debug, Clone, Default)]
pub struct TokenMap {
    entries: Vec<(String, String)>,
}

impl TokenMap {
    /// Parse a comma-separated `agent_id:token` list, the shape used by the
    /// server's `tokens` setting. Whitespace around entries is ignored;
    /// empty entries are skipped.
    pub fn parse(spec: &str) -> Result<Self, TokenParseError> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for (index, pair) in spec.split(',').enumerate() {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (agent_id, token) = pair
                .split_once(':')
                .ok_or(TokenParseError::Malformed(index))?;
            let agent_id = agent_id.trim();
            let token = token.trim();
            if agent_id.is_empty() || token.is_empty() {
                return Err(TokenParseError::Malformed(index));
            }
            for (existing_token, existing_agent) in &entries {
                if existing_token == token {
                    return Err(TokenParseError::DuplicateToken(
                        existing_agent.clone(),
                        agent_id.to_string(),
                    ));
                }
                if existing_agent == agent_id {
                    return Err(TokenParseError::DuplicateAgent(agent_id.to_string()));
                }
            }
            entries.push((token.to_string(), agent_id.to_string()));
        }
        Ok(Self { entries })
    }

    /// Resolve a presented token to its agent id. Every entry is compared
    /// so the work done is independent of which (if any) entry matches.
    pub fn agent_for_token(&self, token: &str) -> Option<&str> {
        let mut found: Option<&str> = None;
        for (candidate, agent_id) in &self.entries {
            if ct_eq(candidate.as_bytes(), token.as_bytes()) {
                found = Some(agent_id.as_str());
            }
        }
        found
    }

    pub fn contains_agent(&self, agent_id: &str) -> bool {
        self.entries.iter().any(|(_, id)| id == agent_id)
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(_, id)| id.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Constant-time byte comparison. Length mismatch still walks the shorter
/// slice before returning false.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff: u8 = if a.len() == b.len() { 0 } else { 1 };
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
