use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use netbank::Engine;
use netbank::auth::{AuthGate, SessionGate};
use netbank::config::AppConfig;
use netbank::engine::RecoveryWorker;
use netbank::http::{AppState, router};
use netbank::ledger::{Ledger, TransferLog};
use netbank::store::{AccountStore, Accounts};
use tokio::net::TcpListener;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::IntervalStream;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> ExitCode {
    let config_path = env::args_os().nth(1).map(PathBuf::from);
    let config = AppConfig::load(config_path.as_deref());

    let log_level = config.as_ref().map_or("info", |c| c.log_level.as_str());
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!(reason = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(reason = %format!("{e:#}"), "server stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
    if config.storage.data_dir.is_none() {
        warn!("no storage.data_dir configured, state will not survive a restart");
    }
    let store: Arc<dyn AccountStore> = match config.storage.accounts_path() {
        Some(path) => Arc::new(
            Accounts::open(&path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(Accounts::in_memory()),
    };
    let ledger: Arc<dyn Ledger> = match config.storage.ledger_path() {
        Some(path) => Arc::new(
            TransferLog::open(&path).with_context(|| format!("opening {}", path.display()))?,
        ),
        None => Arc::new(TransferLog::in_memory()),
    };

    let engine = Arc::new(Engine::with_config(
        store.clone(),
        ledger,
        config.engine.clone(),
    ));
    let gate = Arc::new(SessionGate::new(store, config.auth.clone()));

    if config.recovery.enabled {
        let worker = RecoveryWorker::new(engine.clone(), config.recovery.clone());
        tokio::spawn(worker.run());
    }

    let purger = gate.clone();
    tokio::spawn(async move {
        let mut ticks = IntervalStream::new(tokio::time::interval(SESSION_PURGE_INTERVAL));
        while ticks.next().await.is_some() {
            let purged = purger.purge_expired();
            if purged > 0 {
                debug!(purged, "expired sessions dropped");
            }
        }
    });

    let state = AppState {
        engine,
        gate: gate as Arc<dyn AuthGate>,
    };
    let app = router(state, config.server.static_dir.as_deref());

    let authority = config.server.authority();
    let listener = TcpListener::bind(authority.as_str())
        .await
        .with_context(|| format!("binding {authority}"))?;
    let addr = listener.local_addr().context("reading listen address")?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(reason = %e, "cannot listen for ctrl-c, running until killed");
        std::future::pending::<()>().await;
    }
}
