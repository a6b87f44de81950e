//! Health check endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use herald_broker::Broker;

use crate::consumer::{CounterSnapshot, Counters};
use crate::error::WorkerError;

#[derive(Clone)]
pub struct HealthState {
    broker: Arc<dyn Broker>,
    counters: Arc<Counters>,
    service: String,
}

impl HealthState {
    pub fn new(broker: Arc<dyn Broker>, counters: Arc<Counters>, service: impl Into<String>) -> Self {
        Self {
            broker,
            counters,
            service: service.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct BrokerHealth {
    provider: &'static str,
    connected: bool,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: &'static str,
    broker: BrokerHealth,
    counters: CounterSnapshot,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let connected = state.broker.is_connected();
    let (code, status) = if connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    let body = HealthResponse {
        status,
        service: state.service.clone(),
        version: env!("CARGO_PKG_VERSION"),
        broker: BrokerHealth {
            provider: state.broker.provider_name(),
            connected,
        },
        counters: state.counters.snapshot(),
    };
    (code, Json(body))
}

/// Serve the health router until the listener fails.
pub async fn serve(addr: SocketAddr, state: HealthState) -> Result<(), WorkerError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Health endpoint listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}
