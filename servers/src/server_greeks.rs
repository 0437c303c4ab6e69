//! # Portfolio Greeks Bridge Daemon
//!
//! Resolves configuration, installs logging, then runs the bridge until
//! Ctrl-C or SIGTERM. Only start-up failures end the process with an error;
//! once running, store and transport outages are handled inside the bridge.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;

use lib_bridge::connections::db_postgres::PgStore;
use lib_bridge::ingestors::{PortalClient, SessionClient};
use lib_bridge::{Bridge, SystemClock, TransportClient, TransportMode};

mod greeks_logic;
use greeks_logic::{config, logger};

const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config();
    let _log_guard = logger::setup_logging(&config.log_dir(), config.log_level())?;

    let settings = config.bridge_settings()?;
    let store = PgStore::new(config.database_url()?, config.db_max_connections(), STORE_CONNECT_TIMEOUT)
        .context("cannot configure the destination store")?;

    let bridge = Bridge::new(settings, Arc::new(store), Arc::new(SystemClock));
    let transport: Arc<dyn TransportClient> = match bridge.settings().mode {
        TransportMode::Socket => Arc::new(SessionClient::new(config.session_config()?, bridge.events())),
        TransportMode::Portal => Arc::new(
            PortalClient::new(config.portal_config()?, bridge.events()).context("cannot build the portal client")?,
        ),
    };

    let handle = bridge.start(transport).await.context("bridge start-up failed")?;

    // Wait for shutdown signal
    tokio::select! {
        res = signal::ctrl_c() => {
            res.context("cannot listen for Ctrl-C")?;
            info!("Ctrl-C received, initiating shutdown.");
        }
        res = terminate() => {
            res?;
            info!("SIGTERM received, initiating shutdown.");
        }
    }

    handle.shutdown().await;
    info!("Shutdown complete.");
    Ok(())
}

#[cfg(unix)]
async fn terminate() -> Result<()> {
    let mut term_signal =
        signal::unix::signal(signal::unix::SignalKind::terminate()).context("cannot listen for SIGTERM")?;
    term_signal.recv().await;
    Ok(())
}

#[cfg(not(unix))]
async fn terminate() -> Result<()> {
    // On non-unix platforms, just wait forever.
    std::future::pending::<()>().await;
    Ok(())
}
