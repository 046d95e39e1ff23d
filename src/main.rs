//! Vigil - dependency health monitor
//!
//! Main entry point for the Vigil CLI and server.

mod cli;
mod config;
mod probes;
mod server;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vigil_monitor::{AlertDispatchEngine, ServiceHealthMonitor, ServiceId, ServiceRecoveryManager};

use crate::cli::{Cli, Commands};
use crate::config::VigilConfig;
use crate::probes::{build_action, build_probe};
use crate::server::{create_router, AppState};

/// Initialize tracing with console output and, when `log_dir` is given,
/// a daily-rotated log file.
fn init_tracing(log_dir: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix("vigil")
                .filename_suffix("log")
                .max_log_files(30)
                .build(dir)?;

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // The writer stops flushing once the guard is dropped.
            static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
                std::sync::OnceLock::new();
            let _ = GUARD.set(guard);

            Some(fmt::layer().with_writer(non_blocking).with_ansi(false))
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(file_layer)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.log_dir.as_deref())?;

    let config = VigilConfig::load(&cli.config)?;

    match cli.command {
        None => run_server(config).await,
        Some(Commands::Run { host, port }) => {
            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            run_server(config).await
        }
        Some(Commands::Check { service }) => run_check(config, service).await,
        Some(Commands::Validate) => {
            config.validate()?;
            info!(
                "Configuration {} is valid ({} services)",
                cli.config.display(),
                config.services.len()
            );
            Ok(())
        }
    }
}

/// Build the monitor, recovery manager and dispatcher and register every
/// configured service with them.
fn build_state(config: &VigilConfig) -> Result<Arc<AppState>, Box<dyn std::error::Error>> {
    let dispatcher = Arc::new(AlertDispatchEngine::from_config(&config.alerts));
    let recovery = Arc::new(
        ServiceRecoveryManager::new(config.recovery.clone()).with_dispatcher(dispatcher.clone()),
    );
    let monitor = Arc::new(
        ServiceHealthMonitor::new(config.monitor.clone())
            .with_recovery(recovery.clone())
            .with_dispatcher(dispatcher.clone()),
    );

    for service in &config.services {
        let id = ServiceId::new(service.name.clone());
        monitor.register_service(id.clone(), service.service_type, build_probe(&service.probe)?);
        for hook in &service.recovery {
            recovery.register_strategy(&id, hook.strategy.clone(), build_action(hook)?, hook.priority);
        }
    }

    info!(
        "Registered {} services, alert channels: {}",
        config.services.len(),
        dispatcher.channel_names().join(", ")
    );
    Ok(Arc::new(AppState::new(monitor, recovery, dispatcher)))
}

/// Run the monitor and HTTP server until Ctrl-C.
async fn run_server(config: VigilConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting Vigil v{}", env!("CARGO_PKG_VERSION"));

    let state = build_state(&config)?;
    if config.server.start_monitoring {
        state.monitor.start_monitoring();
    } else {
        warn!("Polling disabled at startup; POST /monitoring/start to begin");
    }

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let app = create_router(state.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Shutdown signal received");
        })
        .await?;

    state.monitor.stop_monitoring().await;
    info!("Vigil stopped");
    Ok(())
}

/// Probe services once and print their metrics as JSON.
///
/// No recovery or alerting happens here.
async fn run_check(
    config: VigilConfig,
    only: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let monitor = ServiceHealthMonitor::new(config.monitor.clone());
    for service in &config.services {
        monitor.register_service(
            service.name.clone(),
            service.service_type,
            build_probe(&service.probe)?,
        );
    }

    let names = match only {
        Some(name) => vec![ServiceId::new(name)],
        None => monitor.registered_services(),
    };

    let mut results = Vec::with_capacity(names.len());
    for name in &names {
        results.push(monitor.check_service_health(name).await?);
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
