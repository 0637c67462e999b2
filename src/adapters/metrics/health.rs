//! Health Check Server - Liveness and Readiness Probes
//!
//! Exposes /live, /ready and /health via axum 0.7. Readiness requires an
//! active source: Startup and BothUnavailable report 503, as does a
//! service that has begun shutting down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tokio::sync::broadcast;
use tracing::{info, instrument};

use crate::usecases::price_router::{HealthSnapshot, RouterHandle};

/// Shared state read by the probes.
#[derive(Debug, Clone)]
pub struct HealthState {
    router: RouterHandle,
    /// Cleared when shutdown begins.
    accepting: Arc<AtomicBool>,
}

impl HealthState {
    pub fn new(router: RouterHandle) -> Self {
        Self {
            router,
            accepting: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flip readiness off ahead of shutdown.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Check if the service is ready to serve traffic.
    pub fn is_ready(&self) -> bool {
        self.accepting.load(Ordering::Relaxed) && self.router.snapshot().is_ready()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        self.router.snapshot()
    }
}

/// Axum-based health check HTTP server.
pub struct HealthServer {
    state: Arc<HealthState>,
    port: u16,
}

impl HealthServer {
    pub fn new(state: Arc<HealthState>, port: u16) -> Self {
        Self { state, port }
    }

    /// Build the probe routes.
    pub fn router(state: Arc<HealthState>) -> Router {
        Router::new()
            .route("/live", get(Self::liveness))
            .route("/ready", get(Self::readiness))
            .route("/health", get(Self::health))
            .with_state(state)
    }

    /// Serve until shutdown is signaled.
    #[instrument(skip(self, shutdown_rx))]
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let app = Self::router(Arc::clone(&self.state));

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        info!(address = %addr, "Health server started");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
            })
            .await?;

        Ok(())
    }

    /// Liveness probe: always returns 200 if the process is running.
    async fn liveness() -> impl IntoResponse {
        (StatusCode::OK, "OK")
    }

    /// Readiness probe: 200 only while a source is active.
    async fn readiness(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
        if state.is_ready() {
            (StatusCode::OK, "READY")
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
        }
    }

    /// Full snapshot as JSON.
    async fn health(State(state): State<Arc<HealthState>>) -> Json<HealthSnapshot> {
        Json(state.snapshot())
    }
}
