//! Server configuration and logging setup.
//!
//! Flags win over environment variables; both fall back to defaults. The
//! token table itself is parsed by `rsm-core` and is never logged.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

use rsm_core::policy::CommandPolicy;

#[derive(Parser, Debug)]
#[command(name = "rsm-server")]
pub struct Args {
    #[arg(long, default_value = "")]
    pub listen_addr: String,
    /// Comma-separated `agent_id:token` pairs (or RSM_TOKENS).
    #[arg(long, default_value = "")]
    pub tokens: String,
    #[arg(long, default_value = "")]
    pub store_path: String,
    #[arg(long, default_value_t = 100)]
    pub max_queue_size: usize,
    #[arg(long, default_value_t = 30)]
    pub history_retention_days: u32,
    #[arg(long, default_value_t = 30)]
    pub ping_interval: u64,
    #[arg(long, default_value_t = 5)]
    pub grace: u64,
    #[arg(long, default_value_t = 2)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 1000)]
    pub max_command_length: usize,
    #[arg(long, default_value_t = false)]
    pub allow_shell_operators: bool,
    #[arg(long, default_value_t = false)]
    pub allow_list_enabled: bool,
    /// Comma-separated allowed base commands; empty uses the built-in list.
    #[arg(long, default_value = "")]
    pub allow_list: String,
    #[arg(long, default_value_t = 30)]
    pub max_timeout: u32,
    #[arg(long, default_value = "")]
    pub log_dir: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub tokens_spec: String,
    pub store_path: String,
    pub policy: CommandPolicy,
    pub max_queue_size: usize,
    pub history_retention_days: u32,
    pub ping_interval: Duration,
    pub grace: Duration,
    pub write_timeout: Duration,
    pub log_dir: String,
    pub debug: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8700".to_string(),
            tokens_spec: String::new(),
            store_path: "rsm.db".to_string(),
            policy: CommandPolicy::default(),
            max_queue_size: 100,
            history_retention_days: 30,
            ping_interval: Duration::from_secs(30),
            grace: Duration::from_secs(5),
            write_timeout: Duration::from_secs(2),
            log_dir: String::new(),
            debug: false,
        }
    }
}

pub fn load_config() -> ServerConfig {
    let args = Args::parse();
    let policy = CommandPolicy {
        max_length: args.max_command_length,
        allow_list_enabled: args.allow_list_enabled,
        allow_list: split_list(&args.allow_list),
        allow_shell_operators: args.allow_shell_operators,
        max_timeout_seconds: args.max_timeout,
        ..CommandPolicy::default()
    };
    ServerConfig {
        listen_addr: resolve(&args.listen_addr, "RSM_ADDR", "127.0.0.1:8700"),
        tokens_spec: resolve(&args.tokens, "RSM_TOKENS", ""),
        store_path: resolve(&args.store_path, "RSM_STORE_PATH", "rsm.db"),
        policy,
        max_queue_size: args.max_queue_size,
        history_retention_days: args.history_retention_days,
        ping_interval: Duration::from_secs(args.ping_interval),
        grace: Duration::from_secs(args.grace),
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir: resolve(&args.log_dir, "RSM_LOG_DIR", ""),
        debug: args.debug || env_true("RSM_DEBUG"),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
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

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for MultiWriter {
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

pub fn init_logging(config: &ServerConfig) -> Option<LogGuard> {
    let level = if config.debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("RSM_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let guard = match open_log_file(&config.log_dir) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("log_file_error: {err}");
            LogGuard { file: None }
        }
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter {
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

fn open_log_file(log_dir: &str) -> io::Result<LogGuard> {
    if log_dir.trim().is_empty() {
        return Ok(LogGuard { file: None });
    }
    let dir = PathBuf::from(log_dir);
    std::fs::create_dir_all(&dir)?;
    let path = dir.join("rsm-server.log");
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_trims_and_drops_empties() {
        assert_eq!(split_list(""), Vec::<String>::new());
        assert_eq!(split_list("ls, pwd ,,echo"), vec!["ls", "pwd", "echo"]);
    }

    #[test]
    fn resolve_prefers_flag() {
        assert_eq!(resolve("flag", "RSM_TEST_UNSET", "default"), "flag");
        assert_eq!(resolve("", "RSM_TEST_UNSET", "default"), "default");
    }
}
