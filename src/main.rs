use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::backend::ComfyClient;
use crate::config::Config;
use crate::orchestrator::Orchestrator;
use crate::web::start_web_server;

mod backend;
mod config;
mod error;
mod models;
mod orchestrator;
mod processor;
mod queue;
mod retry;
mod store;
mod supervisor;
mod sweeper;
#[cfg(test)]
mod testing;
mod web;
mod workflow;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

fn init_logging() {
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vidflow=info,actix_web=info"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(env_filter)
            .init();
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    init_logging();

    let config = Arc::new(Config::from_env());
    info!("Configuration: {:?}", config);

    let backend = ComfyClient::new(
        config.backend_url.clone(),
        config.output_dir.clone(),
        config.output_node.clone(),
    )
    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

    let orchestrator = Arc::new(Orchestrator::new(config.clone(), Arc::new(backend)));

    if let Err(err) = orchestrator.prepare_dirs().await {
        error!("Failed to create storage directories: {err}");
        return Err(std::io::Error::new(std::io::ErrorKind::Other, err));
    }

    let tasks = orchestrator.start();

    let served = start_web_server(orchestrator.clone(), &config.bind_address, config.port).await;

    orchestrator.shutdown();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(tasks)).await;
    if drained.is_err() {
        warn!("background tasks did not stop within {SHUTDOWN_GRACE:?}");
    }

    info!("Shut down");
    served
}
