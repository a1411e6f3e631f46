//! Health, readiness, and metrics HTTP endpoints.
//!
//! Liveness answers 200 whenever the process is responsive. Readiness is
//! 200 only when both the database and the broker are reachable; an
//! orchestrator pulls the instance out of rotation on 503. `/metrics`
//! serves the prometheus text format.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Shared readiness flags, flipped by the owning service as its
/// dependencies connect and disconnect.
#[derive(Clone, Default)]
pub struct Readiness {
    db: Arc<AtomicBool>,
    broker: Arc<AtomicBool>,
}

impl Readiness {
    pub fn new() -> Self {
        Readiness::default()
    }

    pub fn set_db(&self, ready: bool) {
        self.db.store(ready, Ordering::Relaxed);
    }

    pub fn set_broker(&self, ready: bool) {
        self.broker.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.db.load(Ordering::Relaxed) && self.broker.load(Ordering::Relaxed)
    }

    /// Register a 0/1 readiness gauge that mirrors `is_ready`.
    pub fn register_gauge(&self, registry: &Registry) -> IntGauge {
        let gauge = IntGauge::new("service_ready", "1 when DB and broker are both reachable")
            .expect("gauge definition is static");
        registry
            .register(Box::new(gauge.clone()))
            .expect("readiness gauge registered once");
        gauge
    }
}

#[derive(Clone)]
struct HealthState {
    readiness: Readiness,
    registry: Arc<Registry>,
}

pub fn build_router(readiness: Readiness, registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(HealthState {
            readiness,
            registry,
        })
}

async fn healthz() -> impl IntoResponse {
    "ok"
}

async fn readyz(State(state): State<HealthState>) -> impl IntoResponse {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn metrics(State(state): State<HealthState>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = state.registry.gather();
    let mut buf = Vec::new();
    match encoder.encode(&families, &mut buf) {
        Ok(()) => (StatusCode::OK, buf).into_response(),
        Err(e) => {
            error!(error = %e, "metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Bind and serve the health router until shutdown fires.
pub async fn serve(
    bind: &str,
    readiness: Readiness,
    registry: Arc<Registry>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %bind, "health server listening");
    let router = build_router(readiness, registry);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|v| *v).await;
        })
        .await
}
