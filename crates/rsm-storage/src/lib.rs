//! SQLite lifecycle store for the dispatch fabric.
//!
//! The store is the single source of truth for agents and commands. Every
//! status change goes through [`Store::transition`], a compare-and-set over
//! the current status, so concurrent racers see exactly one winner.
//! Timestamps are server-assigned and stored as RFC 3339 text.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql};
use std::path::Path;
use thiserror::Error;

use rsm_core::types::{AgentRecord, AgentStatus, CommandRecord, CommandStatus};

pub const SCHEMA_VERSION: i64 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("duplicate command id: {0}")]
    DuplicateCommand(String),
    #[error("command not found: {0}")]
    NotFound(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Error)]
#[error("invalid status value: {0}")]
struct InvalidStatus(String);

/// A command as accepted for insertion; the store assigns `created_at` and
/// the initial `pending` status.
#[derive(Debug, Clone)]
pub struct NewCommand {
    pub command_id: String,
    pub agent_id: String,
    pub command: String,
    pub timeout_seconds: u32,
    pub priority: i32,
}

/// Field updates applied together with a status transition. `None` fields
/// keep their current value; `clear_sent_at` resets `sent_at` when a send
/// failure reverts a command to `pending`.
#[derive(Debug, Clone, Default)]
pub struct TransitionPatch {
    pub sent_at: Option<DateTime<Utc>>,
    pub clear_sent_at: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub exit_code: Option<i64>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CommandFilter {
    pub agent_id: Option<String>,
    pub status: Option<CommandStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Counts per status plus the average execution time over completed
/// commands.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct CommandStatistics {
    pub total: u64,
    pub pending: u64,
    pub sent: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub cancelled: u64,
    pub avg_execution_time: f64,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: SCHEMA_VERSION,
            });
        }
        if current < 1 {
            let sql = include_str!("../migrations/0001_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn.execute("PRAGMA user_version = 1", []).map(|_| ())?;
        }
        Ok(())
    }

    // ---- agents ----

    pub fn upsert_agent(
        &self,
        agent_id: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<(), StorageError> {
        let metadata_json = metadata.map(|m| m.to_string());
        self.conn.execute(
            "
            INSERT INTO agents (agent_id, status, first_seen, metadata)
            VALUES (?1, 'offline', ?2, ?3)
            ON CONFLICT(agent_id) DO UPDATE SET
                metadata = COALESCE(excluded.metadata, agents.metadata)
            ",
            params![agent_id, Utc::now().to_rfc3339(), metadata_json],
        )?;
        Ok(())
    }

    pub fn mark_agent(&self, agent_id: &str, status: AgentStatus) -> Result<(), StorageError> {
        let changes = self.conn.execute(
            "
            UPDATE agents
            SET status = ?2,
                last_connected = CASE WHEN ?2 = 'online' THEN ?3 ELSE last_connected END
            WHERE agent_id = ?1
            ",
            params![agent_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        if changes == 0 {
            return Err(StorageError::UnknownAgent(agent_id.to_string()));
        }
        Ok(())
    }

    pub fn mark_all_agents_offline(&self) -> Result<usize, StorageError> {
        Ok(self
            .conn
            .execute("UPDATE agents SET status = 'offline'", [])?)
    }

    pub fn get_agent(&self, agent_id: &str) -> Result<Option<AgentRecord>, StorageError> {
        let row = self
            .conn
            .query_row(
                "
                SELECT agent_id, status, first_seen, last_connected, metadata
                FROM agents WHERE agent_id = ?1
                ",
                [agent_id],
                agent_from_row,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT agent_id, status, first_seen, last_connected, metadata
            FROM agents ORDER BY agent_id ASC
            ",
        )?;
        let rows = stmt.query_map([], agent_from_row)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?);
        }
        Ok(agents)
    }

    // ---- commands ----

    pub fn insert_command(&self, cmd: &NewCommand) -> Result<CommandRecord, StorageError> {
        let created_at = Utc::now();
        let result = self.conn.execute(
            "
            INSERT INTO commands (
                command_id, agent_id, command, timeout_seconds, priority,
                status, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
            ",
            params![
                cmd.command_id,
                cmd.agent_id,
                cmd.command,
                i64::from(cmd.timeout_seconds),
                i64::from(cmd.priority),
                created_at.to_rfc3339(),
            ],
        );
        match result {
            Ok(_) => Ok(CommandRecord {
                command_id: cmd.command_id.clone(),
                agent_id: cmd.agent_id.clone(),
                command: cmd.command.clone(),
                timeout_seconds: cmd.timeout_seconds,
                priority: cmd.priority,
                status: CommandStatus::Pending,
                created_at,
                sent_at: None,
                completed_at: None,
                stdout: None,
                stderr: None,
                exit_code: None,
                execution_time: None,
                error_message: None,
            }),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StorageError::DuplicateCommand(cmd.command_id.clone()))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Compare-and-set status transition. The row moves to `to` only if its
    /// current status is in `from`; returns whether the transition fired.
    pub fn transition(
        &self,
        command_id: &str,
        from: &[CommandStatus],
        to: CommandStatus,
        patch: &TransitionPatch,
    ) -> Result<bool, StorageError> {
        let mut sql = String::from("UPDATE commands SET status = ?");
        let mut values: Vec<Box<dyn ToSql>> = vec![Box::new(to.as_str())];

        if patch.clear_sent_at {
            sql.push_str(", sent_at = NULL");
        } else if let Some(ts) = patch.sent_at {
            sql.push_str(", sent_at = ?");
            values.push(Box::new(ts.to_rfc3339()));
        }
        if let Some(ts) = patch.completed_at {
            sql.push_str(", completed_at = ?");
            values.push(Box::new(ts.to_rfc3339()));
        }
        if let Some(ref stdout) = patch.stdout {
            sql.push_str(", stdout = ?");
            values.push(Box::new(stdout.clone()));
        }
        if let Some(ref stderr) = patch.stderr {
            sql.push_str(", stderr = ?");
            values.push(Box::new(stderr.clone()));
        }
        if let Some(code) = patch.exit_code {
            sql.push_str(", exit_code = ?");
            values.push(Box::new(code));
        }
        if let Some(secs) = patch.execution_time {
            sql.push_str(", execution_time = ?");
            values.push(Box::new(secs));
        }
        if let Some(ref message) = patch.error_message {
            sql.push_str(", error_message = ?");
            values.push(Box::new(message.clone()));
        }

        sql.push_str(" WHERE command_id = ? AND status IN (");
        values.push(Box::new(command_id.to_string()));
        for (index, status) in from.iter().enumerate() {
            if index > 0 {
                sql.push_str(", ");
            }
            sql.push('?');
            values.push(Box::new(status.as_str()));
        }
        sql.push(')');

        let changes = self
            .conn
            .execute(&sql, rusqlite::params_from_iter(values))?;
        Ok(changes > 0)
    }

    pub fn get_command(&self, command_id: &str) -> Result<CommandRecord, StorageError> {
        self.conn
            .query_row(
                &format!("{COMMAND_SELECT} WHERE command_id = ?1"),
                [command_id],
                command_from_row,
            )
            .optional()?
            .ok_or_else(|| StorageError::NotFound(command_id.to_string()))
    }

    pub fn list_commands(&self, filter: &CommandFilter) -> Result<Vec<CommandRecord>, StorageError> {
        let mut sql = String::from(COMMAND_SELECT);
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(ref agent_id) = filter.agent_id {
            clauses.push("agent_id = ?");
            values.push(Box::new(agent_id.clone()));
        }
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(after) = filter.created_after {
            clauses.push("created_at >= ?");
            values.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = filter.created_before {
            clauses.push("created_at <= ?");
            values.push(Box::new(before.to_rfc3339()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        values.push(Box::new(i64::from(filter.limit.unwrap_or(100))));
        values.push(Box::new(i64::from(filter.offset.unwrap_or(0))));

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values), command_from_row)?;
        let mut commands = Vec::new();
        for row in rows {
            commands.push(row?);
        }
        Ok(commands)
    }

    /// All `pending` commands for one agent in dispatch order: priority
    /// descending, then oldest first, command id as the final tiebreak.
    pub fn pending_for_agent(&self, agent_id: &str) -> Result<Vec<CommandRecord>, StorageError> {
        let mut stmt = self.conn.prepare(&format!(
            "
            {COMMAND_SELECT}
            WHERE agent_id = ?1 AND status = 'pending'
            ORDER BY priority DESC, created_at ASC, command_id ASC
            "
        ))?;
        let rows = stmt.query_map([agent_id], command_from_row)?;
        let mut commands = Vec::new();
        for row in rows {
            commands.push(row?);
        }
        Ok(commands)
    }

    /// Delete terminal commands created before the cutoff. Non-terminal
    /// rows are never purged.
    pub fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "
            DELETE FROM commands
            WHERE created_at < ?1
              AND status IN ('completed', 'failed', 'timeout', 'cancelled')
            ",
            params![cutoff.to_rfc3339()],
        )?)
    }

    pub fn statistics(&self, agent_id: Option<&str>) -> Result<CommandStatistics, StorageError> {
        let mut stats = CommandStatistics::default();

        let (count_sql, avg_sql) = match agent_id {
            Some(_) => (
                "SELECT status, COUNT(*) FROM commands WHERE agent_id = ?1 GROUP BY status",
                "SELECT AVG(execution_time) FROM commands
                 WHERE status = 'completed' AND agent_id = ?1",
            ),
            None => (
                "SELECT status, COUNT(*) FROM commands GROUP BY status",
                "SELECT AVG(execution_time) FROM commands WHERE status = 'completed'",
            ),
        };

        let mut stmt = self.conn.prepare(count_sql)?;
        let mut collect = |rows: &mut rusqlite::Rows<'_>| -> Result<(), StorageError> {
            while let Some(row) = rows.next()? {
                let status: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                let count = count as u64;
                stats.total += count;
                match CommandStatus::parse(&status) {
                    Some(CommandStatus::Pending) => stats.pending = count,
                    Some(CommandStatus::Sent) => stats.sent = count,
                    Some(CommandStatus::Executing) => stats.executing = count,
                    Some(CommandStatus::Completed) => stats.completed = count,
                    Some(CommandStatus::Failed) => stats.failed = count,
                    Some(CommandStatus::Timeout) => stats.timeout = count,
                    Some(CommandStatus::Cancelled) => stats.cancelled = count,
                    None => {}
                }
            }
            Ok(())
        };
        match agent_id {
            Some(id) => {
                let mut rows = stmt.query([id])?;
                collect(&mut rows)?;
            }
            None => {
                let mut rows = stmt.query([])?;
                collect(&mut rows)?;
            }
        }

        let avg: Option<f64> = match agent_id {
            Some(id) => self.conn.query_row(avg_sql, [id], |row| row.get(0))?,
            None => self.conn.query_row(avg_sql, [], |row| row.get(0))?,
        };
        stats.avg_execution_time = avg.unwrap_or(0.0);
        Ok(stats)
    }

    /// Startup sweep: every command left in `sent` or `executing` by a
    /// previous coordinator run fails fast with the given reason.
    pub fn fail_interrupted(&self, reason: &str) -> Result<usize, StorageError> {
        Ok(self.conn.execute(
            "
            UPDATE commands
            SET status = 'failed', error_message = ?1, completed_at = ?2
            WHERE status IN ('sent', 'executing')
            ",
            params![reason, Utc::now().to_rfc3339()],
        )?)
    }
}

const COMMAND_SELECT: &str = "
    SELECT command_id, agent_id, command, timeout_seconds, priority, status,
           created_at, sent_at, completed_at, stdout, stderr, exit_code,
           execution_time, error_message
    FROM commands
";

fn parse_ts(index: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(err),
            )
        })
}

fn parse_opt_ts(index: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(index, v)).transpose()
}

fn command_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CommandRecord> {
    let status: String = row.get(5)?;
    let status = CommandStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            5,
            rusqlite::types::Type::Text,
            Box::new(InvalidStatus(status.clone())),
        )
    })?;
    Ok(CommandRecord {
        command_id: row.get(0)?,
        agent_id: row.get(1)?,
        command: row.get(2)?,
        timeout_seconds: row.get::<_, i64>(3)? as u32,
        priority: row.get::<_, i64>(4)? as i32,
        status,
        created_at: parse_ts(6, row.get(6)?)?,
        sent_at: parse_opt_ts(7, row.get(7)?)?,
        completed_at: parse_opt_ts(8, row.get(8)?)?,
        stdout: row.get(9)?,
        stderr: row.get(10)?,
        exit_code: row.get(11)?,
        execution_time: row.get(12)?,
        error_message: row.get(13)?,
    })
}

fn agent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let status: String = row.get(1)?;
    let status = AgentStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            Box::new(InvalidStatus(status.clone())),
        )
    })?;
    let metadata: Option<String> = row.get(4)?;
    let metadata = metadata
        .map(|raw| {
            serde_json::from_str(&raw).map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    4,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })
        })
        .transpose()?;
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        status,
        first_seen: parse_ts(2, row.get(2)?)?,
        last_connected: parse_opt_ts(3, row.get(3)?)?,
        metadata,
    })
}
