//! Agent configuration and logging.
//!
//! The token is required and must never reach logs or error text; the
//! endpoint URL carries it only as the socket query parameter.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use thiserror::Error;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};
use url::Url;

use rsm_core::policy::CommandPolicy;

/// Per-stream ceiling on captured output, protecting the coordinator's
/// store from runaway commands.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "rsm-agent")]
pub struct Args {
    /// Coordinator socket URL, e.g. ws://host:8700/ws (or RSM_SERVER_URL).
    #[arg(long, default_value = "")]
    pub server_url: String,
    /// Device token (or RSM_TOKEN).
    #[arg(long, default_value = "")]
    pub token: String,
    #[arg(long, default_value_t = 30)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 1000)]
    pub reconnect_initial_ms: u64,
    #[arg(long, default_value_t = 60000)]
    pub reconnect_cap_ms: u64,
    #[arg(long, default_value_t = 1000)]
    pub max_command_length: usize,
    #[arg(long, default_value_t = false)]
    pub allow_shell_operators: bool,
    #[arg(long, default_value_t = false)]
    pub allow_list_enabled: bool,
    #[arg(long, default_value = "")]
    pub allow_list: String,
    #[arg(long, default_value_t = 30)]
    pub max_timeout: u32,
    #[arg(long, default_value = "")]
    pub log_file: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device token is required (set --token or RSM_TOKEN)")]
    MissingToken,
    #[error("invalid server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Socket endpoint with the token appended as a query parameter.
    pub endpoint: Url,
    pub policy: CommandPolicy,
    pub ping_interval: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_cap: Duration,
    pub max_output_bytes: usize,
    pub log_file: String,
    pub debug: bool,
}

pub fn load_config() -> Result<AgentConfig, ConfigError> {
    let args = Args::parse();
    from_args(args)
}

fn from_args(args: Args) -> Result<AgentConfig, ConfigError> {
    let token = resolve(&args.token, "RSM_TOKEN", "");
    if token.is_empty() {
        return Err(ConfigError::MissingToken);
    }
    let raw_url = resolve(&args.server_url, "RSM_SERVER_URL", "ws://127.0.0.1:8700/ws");
    let mut endpoint = Url::parse(&raw_url)?;
    endpoint.query_pairs_mut().append_pair("token", &token);

    let policy = CommandPolicy {
        max_length: args.max_command_length,
        allow_list_enabled: args.allow_list_enabled,
        allow_list: args
            .allow_list
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(str::to_string)
            .collect(),
        allow_shell_operators: args.allow_shell_operators,
        max_timeout_seconds: args.max_timeout,
        ..CommandPolicy::default()
    };

    Ok(AgentConfig {
        endpoint,
        policy,
        ping_interval: Duration::from_secs(args.ping_interval),
        reconnect_initial: Duration::from_millis(args.reconnect_initial_ms),
        reconnect_cap: Duration::from_millis(args.reconnect_cap_ms),
        max_output_bytes: MAX_OUTPUT_BYTES,
        log_file: resolve(&args.log_file, "RSM_LOG_FILE", ""),
        debug: args.debug || env_true("RSM_DEBUG"),
    })
}

fn resolve(flag: &str, env_key: &str, default: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(env_key) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    default.to_string()
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

pub struct LogGuard {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

struct TeeWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

pub fn init_logging(config: &AgentConfig) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RSM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file = if config.log_file.trim().is_empty() {
        None
    } else {
        match OpenOptions::new()
            .create(true)
            .append(true)
            .open(&config.log_file)
        {
            Ok(file) => Some(Arc::new(Mutex::new(file))),
            Err(err) => {
                eprintln!("log_file_error: {err}");
                None
            }
        }
    };
    let guard = LogGuard { file: file.clone() };
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        stdout: io::stdout(),
        file: file.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}
