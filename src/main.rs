use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::prelude::*;

use ssmgr::config::Config;
use ssmgr::dns::SystemResolver;
use ssmgr::metrics::{MetricsSink, NoopMetrics};
use ssmgr::proxy_manager::ProxyManager;
use ssmgr::registry::UserRegistry;
use ssmgr::replay::ReplayGuard;
use ssmgr::rpc;
use ssmgr::sync::SyncDriver;

#[derive(Parser)]
#[command(name = "ssmgr", version, about = "Multi-user Shadowsocks proxy server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server (default when no subcommand given)
    Run,

    /// Validate environment configuration without starting any listeners
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Check) => cmd_check(),
        Some(Commands::Run) | None => cmd_run().await,
    }
}

fn cmd_check() -> Result<()> {
    match Config::from_env() {
        Ok(config) => {
            println!("configuration is valid");
            println!("  listen_host:    {}", config.listen_host);
            println!("  sync_source:    {:?}", config.sync_source);
            println!("  sync_period:    {:?}", config.sync_period);
            println!("  rpc:            {}:{}", config.rpc_host, config.rpc_port);
            println!("  idle_timeout:   {:?}", config.idle_timeout);
            println!("  tcp_conn_limit: {}", config.tcp_conn_limit);
            Ok(())
        }
        Err(e) => {
            eprintln!("configuration is invalid: {e}");
            std::process::exit(1);
        }
    }
}

async fn cmd_run() -> Result<()> {
    let config = Config::from_env()?;

    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone())),
    );
    tracing_subscriber::registry().with(fmt_layer).init();

    info!("ssmgr starting");
    if let Some(port) = config.metrics_port {
        info!(port, "SS_METRICS_PORT configured but no metrics server is started (out of scope)");
    }

    let registry = Arc::new(UserRegistry::new());
    let replay_guard = Arc::new(ReplayGuard::new());
    let resolver = Arc::new(SystemResolver);

    let metrics: Arc<dyn MetricsSink> = Arc::new(NoopMetrics);

    let proxy_manager = Arc::new(ProxyManager::new(
        config.listen_host.clone(),
        registry.clone(),
        replay_guard.clone(),
        resolver,
        config.idle_timeout,
        config.tcp_conn_limit,
        metrics,
    ));

    let sync_driver = Arc::new(SyncDriver::new(
        config.sync_source.clone(),
        registry.clone(),
        proxy_manager.clone(),
    ));
    sync_driver.run_once().await;

    let cancel = CancellationToken::new();

    let sync_task = sync_driver.spawn(config.sync_period, cancel.clone());
    let rpc_task = rpc::spawn(
        config.rpc_host.clone(),
        config.rpc_port,
        registry.clone(),
        replay_guard,
        proxy_manager.clone(),
        cancel.clone(),
    );

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    cancel.cancel();

    let _ = sync_task.await;
    let _ = rpc_task.await;
    proxy_manager.shutdown().await;

    info!("ssmgr stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
