//! Prometheus scrape endpoint serving a [`MetricsRegistry`] for the life of a run

use crate::error::Result;
use crate::monitoring::metrics::MetricsRegistry;
use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const METRICS_PATH: &str = "/metrics";

pub struct MetricsServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and serve the registry in a background task
    pub async fn start(addr: SocketAddr, registry: MetricsRegistry) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let router = Router::new()
            .route(METRICS_PATH, get(metrics_handler))
            .with_state(registry);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await })
                .await;
            if let Err(e) = served {
                warn!(error = %e, "Metrics endpoint stopped");
            }
        });

        info!(addr = %local_addr, path = METRICS_PATH, "Serving progress metrics");
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Metrics endpoint task failed");
        }
    }
}

async fn metrics_handler(State(registry): State<MetricsRegistry>) -> Response {
    match registry.encode_text() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {}", e)).into_response(),
    }
}
