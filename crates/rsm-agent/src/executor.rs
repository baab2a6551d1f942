//! Local command execution.
//!
//! Commands run under `/bin/sh -c` with piped output and a hard deadline.
//! A timed-out command is killed (the dropped future takes the child with
//! it via `kill_on_drop`) and reported as a normal result with exit code
//! -1, matching what the coordinator expects from a self-terminating
//! agent.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("command execution failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub execution_time: f64,
    pub timed_out: bool,
}

pub async fn execute(
    command: &str,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ExecOutcome, ExecError> {
    let started = std::time::Instant::now();
    let child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(ExecOutcome {
            stdout: capture(&output.stdout, max_output_bytes),
            stderr: capture(&output.stderr, max_output_bytes),
            exit_code: i64::from(output.status.code().unwrap_or(-1)),
            execution_time: started.elapsed().as_secs_f64(),
            timed_out: false,
        }),
        Ok(Err(err)) => Err(err.into()),
        Err(_elapsed) => Ok(ExecOutcome {
            stdout: String::new(),
            stderr: format!("command timed out after {} seconds", timeout.as_secs()),
            exit_code: -1,
            execution_time: started.elapsed().as_secs_f64(),
            timed_out: true,
        }),
    }
}

fn capture(bytes: &[u8], max_output_bytes: usize) -> String {
    if bytes.len() > max_output_bytes {
        let mut text = String::from_utf8_lossy(&bytes[..max_output_bytes]).into_owned();
        text.push_str("\n[output truncated]");
        text
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}
