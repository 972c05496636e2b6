//! Submarine Console - Backend
//!
//! REST API for a remote-operated submarine: missions, telemetry, the event
//! log, target images and the autonomy state. Configured entirely through
//! environment variables (see `ServerConfig`).

use submarine_console_lib::{server, ServerConfig};

async fn run_web(config: ServerConfig) {
    log::info!("Database: {:?}", config.db_path);
    log::info!("Static directory: {:?}", config.static_dir);

    if let Err(e) = server::start_server(config).await {
        log::error!("Server failed: {:#}", e);
        std::process::exit(1);
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            std::process::exit(1);
        }
    };
    runtime.block_on(run_web(config));
}
