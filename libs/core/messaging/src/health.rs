//! Health endpoints for container probes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// Health status of the worker.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub broker_connected: bool,
    pub processor_healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Shared health state, updated by the worker.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<RwLock<HealthStateInner>>,
}

struct HealthStateInner {
    broker_connected: bool,
    processor_healthy: bool,
    fatal: bool,
    last_error: Option<String>,
}

impl HealthState {
    /// Starts alive but not ready: nothing is connected yet.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HealthStateInner {
                broker_connected: false,
                processor_healthy: true,
                fatal: false,
                last_error: None,
            })),
        }
    }

    pub async fn set_broker_connected(&self, connected: bool) {
        self.inner.write().await.broker_connected = connected;
    }

    pub async fn set_processor_healthy(&self, healthy: bool) {
        self.inner.write().await.processor_healthy = healthy;
    }

    /// Record an error the worker cannot recover from.
    pub async fn set_fatal(&self, error: impl Into<String>) {
        let mut inner = self.inner.write().await;
        inner.fatal = true;
        inner.last_error = Some(error.into());
    }

    /// Liveness.
    ///
    /// Neither a broker outage nor an unhealthy downstream is a reason to
    /// restart: both recover on their own. Only a fatal error flips this.
    pub async fn is_alive(&self) -> bool {
        !self.inner.read().await.fatal
    }

    /// Readiness: consuming right now.
    pub async fn is_ready(&self) -> bool {
        let inner = self.inner.read().await;
        inner.broker_connected && inner.processor_healthy
    }

    pub async fn status(&self) -> HealthStatus {
        let inner = self.inner.read().await;
        let status = if inner.fatal {
            "failed"
        } else if !inner.broker_connected {
            "reconnecting"
        } else if !inner.processor_healthy {
            "degraded"
        } else {
            "healthy"
        };
        HealthStatus {
            status: status.to_string(),
            broker_connected: inner.broker_connected,
            processor_healthy: inner.processor_healthy,
            last_error: inner.last_error.clone(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP server exposing liveness, readiness and Prometheus metrics.
pub struct HealthServer {
    port: u16,
    state: HealthState,
    metrics_handle: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            state: HealthState::new(),
            metrics_handle: None,
        }
    }

    /// Set the metrics handle for the /metrics endpoint.
    pub fn with_metrics(mut self, handle: metrics_exporter_prometheus::PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Get the health state for updates.
    pub fn state(&self) -> HealthState {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .with_state(self.state.clone());

        if let Some(handle) = self.metrics_handle.clone() {
            router = router.route(
                "/metrics",
                get(move || {
                    let handle = handle.clone();
                    async move { handle.render() }
                }),
            );
        }

        router
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_alive().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}

async fn ready_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let code = if state.is_ready().await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(state.status().await))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_state_is_alive_but_not_ready() {
        let state = HealthState::new();
        assert!(state.is_alive().await);
        assert!(!state.is_ready().await);
        assert_eq!(state.status().await.status, "reconnecting");
    }

    #[tokio::test]
    async fn test_connected_state_is_ready() {
        let state = HealthState::new();
        state.set_broker_connected(true).await;
        assert!(state.is_ready().await);
        assert_eq!(state.status().await.status, "healthy");
    }

    #[tokio::test]
    async fn test_fatal_error_fails_liveness() {
        let state = HealthState::new();
        state.set_broker_connected(true).await;
        state.set_fatal("bad credentials").await;

        assert!(!state.is_alive().await);
        assert!(!state.is_ready().await);
        let status = state.status().await;
        assert_eq!(status.status, "failed");
        assert_eq!(status.last_error.as_deref(), Some("bad credentials"));
    }

    #[tokio::test]
    async fn test_unhealthy_processor_affects_readiness_only() {
        let state = HealthState::new();
        state.set_broker_connected(true).await;
        state.set_processor_healthy(false).await;

        assert!(state.is_alive().await);
        assert!(!state.is_ready().await);
        assert_eq!(state.status().await.status, "degraded");

        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let response = ready_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_handlers_status_codes() {
        let state = HealthState::new();

        let response = ready_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        state.set_broker_connected(true).await;
        let response = ready_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
