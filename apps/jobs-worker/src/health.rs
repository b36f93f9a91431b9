//! Health endpoints for K8s probes, plus pipeline state and metrics.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use jobs::JobSource;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub status: String,
    pub pipeline_ready: bool,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Health server for K8s probes.
pub struct HealthServer {
    port: u16,
    source: Arc<dyn JobSource>,
    metrics_handle: Option<PrometheusHandle>,
}

impl HealthServer {
    pub fn new(port: u16, source: Arc<dyn JobSource>) -> Self {
        Self {
            port,
            source,
            metrics_handle: None,
        }
    }

    /// Set the metrics handle for /metrics endpoint.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics_handle = Some(handle);
        self
    }

    /// Build the router.
    pub fn router(&self) -> Router {
        let mut router = Router::new()
            .route("/health", get(health_handler))
            .route("/healthz", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/readyz", get(ready_handler))
            .route("/state", get(state_handler))
            .with_state(self.source.clone());

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

    /// Run the health server.
    pub async fn run(self) -> Result<(), std::io::Error> {
        let router = self.router();
        let addr = format!("0.0.0.0:{}", self.port);

        info!(addr = %addr, "Starting health server");

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}

/// Liveness probe handler. The process answering is enough; a paused or
/// stopped pipeline is reported but does not fail the probe.
async fn health_handler(State(source): State<Arc<dyn JobSource>>) -> impl IntoResponse {
    let pipeline_ready = source.state().await.is_ok_and(|state| state.ready);

    Json(HealthStatus {
        status: "healthy".to_string(),
        pipeline_ready,
    })
}

/// Readiness probe handler: ready while the pipeline listener is delivering.
async fn ready_handler(State(source): State<Arc<dyn JobSource>>) -> Response {
    match source.state().await {
        Ok(state) if state.ready => (
            StatusCode::OK,
            Json(HealthStatus {
                status: "ready".to_string(),
                pipeline_ready: true,
            }),
        )
            .into_response(),
        Ok(state) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: format!("pipeline {} is not consuming", state.pipeline),
                pipeline_ready: false,
            }),
        )
            .into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthStatus {
                status: format!("unavailable: {}", e),
                pipeline_ready: false,
            }),
        )
            .into_response(),
    }
}

async fn state_handler(State(source): State<Arc<dyn JobSource>>) -> Response {
    match source.state().await {
        Ok(state) => Json(state).into_response(),
        Err(e) => {
            let status = if e.is_transient() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::CONFLICT
            };
            (status, Json(ErrorBody { error: e.to_string() })).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use jobs::{Pipeline, PipelineState, PriorityQueue};
    use nats_jobs::{resolve_pipeline, Broker, MemoryBroker, NatsConfig, NatsConsumer};
    use tower::ServiceExt;

    fn pipeline() -> Pipeline {
        Pipeline::new("emails", "nats")
            .with("subject", "jobs.emails")
            .with("stream", "emails")
    }

    async fn source() -> Arc<dyn JobSource> {
        let config = resolve_pipeline(Some(&NatsConfig::new("nats://memory")), &pipeline()).unwrap();
        let broker: Arc<dyn Broker> = Arc::new(MemoryBroker::new());
        let consumer = NatsConsumer::with_broker(broker, config, Arc::new(PriorityQueue::new()))
            .await
            .unwrap();
        Arc::new(consumer)
    }

    async fn get(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_always_ok_and_reports_pipeline() {
        let source = source().await;
        let server = HealthServer::new(0, source.clone());

        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["pipeline_ready"], false);

        source.register(pipeline()).await.unwrap();
        source.run(&pipeline()).await.unwrap();
        let (_, body) = get(server.router(), "/health").await;
        assert_eq!(body["pipeline_ready"], true);

        source.pause("emails").await.unwrap();
        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pipeline_ready"], false);

        source.stop().await.unwrap();
        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pipeline_ready"], false);
    }

    #[tokio::test]
    async fn test_ready_follows_pipeline() {
        let source = source().await;
        let server = HealthServer::new(0, source.clone());

        // Not registered yet
        let (status, _) = get(server.router(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        source.register(pipeline()).await.unwrap();
        let (status, body) = get(server.router(), "/ready").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["pipeline_ready"], false);

        source.run(&pipeline()).await.unwrap();
        let (status, body) = get(server.router(), "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pipeline_ready"], true);

        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_reports_pipeline() {
        let source = source().await;
        let server = HealthServer::new(0, source.clone());

        let (status, body) = get(server.router(), "/state").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].is_string());

        source.register(pipeline()).await.unwrap();
        source.run(&pipeline()).await.unwrap();

        let (status, body) = get(server.router(), "/state").await;
        assert_eq!(status, StatusCode::OK);
        let state: PipelineState = serde_json::from_value(body).unwrap();
        assert_eq!(state.pipeline, "emails");
        assert_eq!(state.driver, "nats");
        assert_eq!(state.queue, "jobs.emails");
        assert!(state.ready);

        source.stop().await.unwrap();
    }
}
