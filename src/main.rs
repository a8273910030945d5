mod admin;
mod auth;
mod catalog;
mod cli;
mod config;
mod error;
mod health;
mod protocol;
mod registry;
mod router;
mod session;
mod sse;
#[cfg(test)]
mod testutil;
mod tracker;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{Notify, mpsc};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::auth::AccessControl;
use crate::catalog::ToolCatalog;
use crate::config::GatewayConfig;
use crate::health::SupervisorConfig;
use crate::registry::BackendRegistry;
use crate::router::Gateway;
use crate::sse::BackoffConfig;
use crate::tracker::CallTracker;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = cli::Cli::parse();

    // Configuration problems (flags, env vars, policy/seed files) exit 2.
    let config = match GatewayConfig::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let filter =
        EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let acl = match AccessControl::load(config.acl_file.as_deref()) {
        Ok(acl) => acl,
        Err(e) => {
            error!(error = %format!("{e:#}"), "failed to load ACL policy");
            return ExitCode::from(2);
        }
    };

    let seed = match &config.backends_file {
        Some(path) => match config::load_backends_seed(path) {
            Ok(seed) => seed,
            Err(e) => {
                error!(error = %format!("{e:#}"), "failed to load backends file");
                return ExitCode::from(2);
            }
        },
        None => Vec::new(),
    };

    // Anything past this point is a startup failure (exit 1), not config.
    match run(config, acl, seed).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{e:#}"), "gateway startup failed");
            ExitCode::from(1)
        }
    }
}

async fn run(
    config: GatewayConfig,
    acl: AccessControl,
    seed: Vec<crate::registry::BackendDescriptor>,
) -> Result<()> {
    info!(
        bind = %config.bind,
        backends = seed.len(),
        collision_policy = ?config.collision_policy,
        "toolgate starting"
    );

    // Sessions report transport failures to the supervisor over this
    // one-way channel.
    let (signal_tx, signal_rx) = mpsc::unbounded_channel();

    let registry = BackendRegistry::new(
        config.session.clone(),
        BackoffConfig {
            min: config.reconnect_backoff_min,
            max: config.reconnect_backoff_max,
        },
        signal_tx,
        Some(config.store_path.clone()),
    );

    // Runtime-registered backends first (re-registration wins), then the
    // seed file.
    let restored = registry.load_store().await;
    if restored > 0 {
        info!(backends = restored, "backends restored from store");
    }
    for descriptor in seed {
        let id = descriptor.id.clone();
        if let Err(e) = registry.register(descriptor).await {
            warn!(backend = %id, error = %e, "seed backend skipped");
        }
    }

    let catalog = ToolCatalog::new(
        Arc::clone(&registry),
        config.catalog_ttl,
        config.collision_policy,
    );
    catalog.spawn_invalidation_task();

    let shutdown = Arc::new(Notify::new());

    // Health supervisor.
    {
        let supervisor_config = SupervisorConfig::from_gateway(&config);
        let registry = Arc::clone(&registry);
        let catalog = Arc::clone(&catalog);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            health::run_supervisor(registry, catalog, supervisor_config, signal_rx, shutdown)
                .await;
        });
    }

    // Seed file hot-reload.
    if let Some(path) = config.backends_file.clone() {
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            config::watch_backends_file(path, registry, shutdown).await;
        });
    }

    let gateway = Gateway::new(
        config.clone(),
        Arc::clone(&registry),
        catalog,
        Arc::new(acl),
        Arc::new(CallTracker::new()),
        Arc::clone(&shutdown),
    );
    let app = router::app(gateway);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("cannot bind {}", config.bind))?;
    info!(bind = %config.bind, "gateway listening");

    let signal_shutdown = Arc::clone(&shutdown);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            signal_shutdown.notify_waiters();
        })
        .await
        .context("server error")?;

    info!("shutting down");
    shutdown.notify_waiters();
    registry.close_all().await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install SIGINT handler");
            std::future::pending::<()>().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("received ctrl-c");
}
