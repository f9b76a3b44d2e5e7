//! Web server for triggering pipelines and streaming events.
//!
//! Exposes the JSON trigger/query API and the `/ws` event stream, and runs
//! the file watcher alongside the listener. Shutdown is orderly: cancel the
//! active pipeline, close the hub, stop the watcher.

mod handlers;
mod routes;

pub use routes::create_router;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::hub::EventHub;
use crate::pipeline::PipelineManager;
use crate::watcher::FileWatcher;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PipelineManager>,
    pub hub: Arc<EventHub>,
}

impl AppState {
    pub fn new(settings: &Settings) -> Self {
        let hub = Arc::new(EventHub::new(settings.hub_buffer));
        let manager = PipelineManager::new(settings.clone(), hub.clone());
        Self { manager, hub }
    }
}

/// Start the web server and file watcher; runs until ctrl-c.
pub async fn serve(settings: &Settings) -> anyhow::Result<()> {
    let state = AppState::new(settings);
    let stop = CancellationToken::new();

    let watcher = FileWatcher::new(
        settings.reports_dir(),
        settings.watch_debounce(),
        state.hub.clone(),
    );
    let watcher_handle = watcher.spawn(stop.child_token());

    let app = create_router(state.clone());
    let addr: SocketAddr = settings.bind.parse()?;
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Orderly teardown: pipeline first, then subscribers, then the watcher.
    state.manager.shutdown().await;
    state.hub.close().await;
    stop.cancel();
    let _ = watcher_handle.await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
