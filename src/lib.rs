pub mod api;
pub mod client;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod files;
pub mod network;
pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::{validate_config, ServerConfig};
use crate::crypto::Identity;
use crate::files::FileStore;
use crate::network::{neighbourhood, ServerState, SharedState};

/// A running home server. Dropping the handle does not stop it; call
/// [`ServerHandle::shutdown`] or let the process signal handler do so.
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub async fn wait(self) {
        let _ = self.task.await;
    }
}

/// Bind and start serving. Returns once the listener is accepting, so
/// callers (and tests) can connect immediately.
pub async fn serve(config: ServerConfig) -> anyhow::Result<ServerHandle> {
    let validation = validate_config(&config);
    validation.print_summary();
    if !validation.valid {
        anyhow::bail!("configuration invalid");
    }

    let identity = Identity::generate().context("generating server identity")?;
    info!(fingerprint = %identity.fingerprint, "server identity ready");

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    let addr = listener.local_addr()?;

    let files = Arc::new(
        FileStore::open(&config.files_dir, &config.public_addr)
            .with_context(|| format!("opening file store {}", config.files_dir.display()))?,
    );

    let state: SharedState = Arc::new(ServerState::new(config, identity));
    tokio::spawn(network::prune_routed_task(state.clone()));
    neighbourhood::start(state.clone());

    let router = api::router(state.clone(), files);
    let shutdown = state.shutdown.clone();
    let mut stop = state.shutdown.subscribe();
    let task = tokio::spawn(async move {
        let serving = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = stop.recv().await;
        });
        if let Err(e) = serving.await {
            error!("server error: {}", e);
        }
    });

    info!(%addr, public = %state.config.public_addr, "listening");
    Ok(ServerHandle {
        addr,
        shutdown,
        task,
    })
}

/// Entry point for the server binary: env config, Ctrl+C shutdown.
pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = ServerConfig::from_env();
    let handle = serve(config).await?;

    let shutdown = handle.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received, notifying tasks...");
            let _ = shutdown.send(());
        }
    });

    handle.wait().await;
    Ok(())
}
