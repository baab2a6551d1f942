mod config;
mod executor;
mod session;

use std::sync::Arc;

use tracing::info;

#[tokio::main]
async fn main() {
    let agent_config = match config::load_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("config error: {err}");
            std::process::exit(1);
        }
    };
    let _log_guard = config::init_logging(&agent_config);
    info!(event = "agent_start", endpoint_host = %agent_config.endpoint.host_str().unwrap_or(""));
    session::run(Arc::new(agent_config)).await;
}
