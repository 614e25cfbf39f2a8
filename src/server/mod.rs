//! HTTP gateway in front of the worker pool.
//!
//! Every request, whatever its method or path, is buffered, turned into a
//! request envelope and relayed to an idle worker. Dispatch failures become a
//! plain-text 502.
//!
//! # Example
//!
//! ```bash
//! tusk start worker.php --port 8080
//! curl -X POST -H 'X-Test: 1' -d ping http://localhost:8080/anything
//! ```

pub mod error;
pub mod middleware;
pub mod relay;

use std::future::IntoFuture;
use std::sync::Arc;

use axum::{Router, extract::DefaultBodyLimit};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::{Result, TuskError};
use crate::worker::{Dispatcher, Supervisor};

/// Shared application state.
pub struct AppState {
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(dispatcher: Dispatcher) -> Self {
        Self { dispatcher }
    }
}

/// Listener settings for [`run_server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` to bind.
    pub bind: String,
    /// Largest accepted request body; larger bodies get 413.
    pub max_body_bytes: usize,
}

/// Build the gateway router: a single catch-all route plus request ID and
/// tracing middleware.
pub fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .fallback(relay::relay)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(axum::middleware::from_fn(middleware::request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve requests until SIGINT or SIGTERM, then stop the worker pool.
///
/// Workers are killed as soon as the signal arrives, so requests still in
/// flight fail with a 502 instead of holding up the exit. Only then does the
/// listener drain its connections.
pub async fn run_server(config: ServerConfig, supervisor: &Supervisor) -> Result<()> {
    let state = Arc::new(AppState::new(supervisor.dispatcher()));
    let app = build_router(state, config.max_body_bytes);

    let listener = match TcpListener::bind(&config.bind).await {
        Ok(listener) => listener,
        Err(e) => {
            supervisor.shutdown().await;
            return Err(TuskError::Config(format!(
                "failed to bind {}: {}",
                config.bind, e
            )));
        }
    };
    let local = listener.local_addr()?;
    info!(address = %local, workers = supervisor.stats().total, "Listening");

    let (drain_tx, drain_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = drain_rx.await;
    });
    let mut serving = std::pin::pin!(server.into_future());

    let served = tokio::select! {
        result = &mut serving => result,
        _ = shutdown_signal() => {
            info!("Stopping workers");
            supervisor.shutdown().await;
            let _ = drain_tx.send(());
            serving.await
        }
    };

    supervisor.shutdown().await;
    served?;
    info!("Server stopped");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
///
/// A handler that cannot be installed is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
