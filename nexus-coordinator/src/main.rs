/**
 * NEXUS COORDINATOR - Entry point of the gaming-center coordinator
 *
 * ROLE : Wires config, session ledger, fleet store, stream server, LAN
 * beacon and display API together, then runs until Ctrl-C.
 *
 * ARCHITECTURE : agents stream heartbeats over TCP, the fleet store turns
 * them into billed sessions, the front desk reads and settles over HTTP.
 */

mod billing;
mod config;
mod discovery;
mod fleet;
mod health;
mod http;
mod models;
mod server;
mod session;
mod store;

use crate::config::{load_config, StoreBackend};
use crate::fleet::FleetStore;
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::server::StreamSettings;
use crate::store::{JsonSessionStore, MemorySessionStore, SessionStore};

use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = load_config()
        .await
        .inspect_err(|e| error!(error = %e, "invalid coordinator configuration"))
        .context("loading coordinator configuration")?;

    // session ledger
    let mut json_store: Option<Arc<JsonSessionStore>> = None;
    let store: Arc<dyn SessionStore> = match cfg.store.backend {
        StoreBackend::Json => {
            let opened = JsonSessionStore::open(&cfg.store.path)
                .inspect_err(|e| error!(path = %cfg.store.path.display(), error = %e, "cannot open session store"))
                .context("opening session store")?;
            let opened = Arc::new(opened);
            json_store = Some(Arc::clone(&opened));
            opened
        }
        StoreBackend::Memory => {
            warn!("in-memory session store, ledger is lost on exit");
            Arc::new(MemorySessionStore::new())
        }
    };

    let fleet = Arc::new(FleetStore::new(store, cfg.billing.hourly_rate));
    fleet
        .recover_stale_sessions()
        .context("recovering stale sessions")?;

    let flusher = json_store.as_ref().map(|s| {
        store::spawn_flusher(
            Arc::clone(s),
            Duration::from_secs(cfg.store.flush_interval_secs),
        )
    });

    // stream server
    let service_addr = SocketAddr::from(([0, 0, 0, 0], cfg.service_port));
    let listener = TcpListener::bind(service_addr)
        .await
        .inspect_err(|e| error!(%service_addr, error = %e, "cannot bind service port"))
        .with_context(|| format!("binding service port {}", cfg.service_port))?;

    // beacon
    let beacon = if cfg.discovery.enabled {
        match discovery::start_discovery(&cfg.discovery).await {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "discovery beacon unavailable, agents need a manual address");
                None
            }
        }
    } else {
        info!("discovery beacon disabled");
        None
    };

    let health = HealthTracker::new();

    // display API
    if cfg.http.enabled {
        let app_state = AppState {
            fleet: Arc::clone(&fleet),
            health: health.clone(),
        };
        if let Err(e) = http::spawn_http(cfg.http.port, app_state).await {
            warn!(port = cfg.http.port, error = %e, "display API unavailable");
        }
    }

    info!(
        port = cfg.service_port,
        hourly_rate = cfg.billing.hourly_rate,
        "coordinator ready"
    );

    let settings = StreamSettings {
        idle_timeout: Duration::from_secs(cfg.stream_idle_timeout_secs),
    };
    tokio::select! {
        _ = server::serve(listener, Arc::clone(&fleet), health, settings) => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for shutdown signal");
            }
            info!("shutdown requested");
        }
    }

    if let Some(handle) = beacon {
        handle.stop().await;
    }
    if let Some(task) = flusher {
        task.abort();
    }
    if let Some(store) = json_store {
        match store.persist() {
            Ok(_) => info!(path = %store.path().display(), "session ledger saved"),
            Err(e) => error!(error = %e, "final ledger save failed"),
        }
    }

    Ok(())
}
