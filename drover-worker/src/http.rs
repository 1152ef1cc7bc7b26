//! The HTTP boundary: health, lifecycle hooks and metrics.
use std::{io, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use drover::prelude::*;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

#[derive(Clone)]
pub struct AppState {
    pub queue: Queue,
    pub worker: WorkerHandle,
    pub read_positions: Option<Arc<ReadPositionGauge>>,
    pub metric_prefix: Arc<str>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/_ah/health", get(health))
        .route("/lifecycle/prestop", get(prestop))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Serves `router` on `listener` until `shutdown` is cancelled. Connections in flight when the
/// token is cancelled are completed.
pub fn serve(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
    })
}

async fn health() -> StatusCode {
    StatusCode::OK
}

/// Closes the worker and answers once it drained.
async fn prestop(State(state): State<AppState>) -> StatusCode {
    tracing::info!("Prestop lifecycle hook called");
    let report = state.worker.close().await;
    if !report.is_clean() {
        tracing::warn!(abandoned = report.abandoned, "Worker closed with abandoned jobs");
    }
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> Response {
    match MetricsSnapshot::collect(&state.queue, state.read_positions.as_deref()).await {
        Ok(snapshot) => (
            [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
            snapshot.render(&state.metric_prefix),
        )
            .into_response(),
        Err(error) => {
            tracing::error!(?error, "Failed to collect metrics: {error}");
            (StatusCode::BAD_REQUEST, error.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use drover::{backend::memory::InMemoryBackend, job::JobState};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state(queue: &Queue) -> AppState {
        let worker = Worker::new(queue.clone(), DispatchTable::default()).spawn();
        AppState {
            queue: queue.clone(),
            worker,
            read_positions: None,
            metric_prefix: "drover".into(),
        }
    }

    async fn request(state: &AppState, uri: &str) -> (StatusCode, String) {
        let response = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn health_checks() {
        let state = state(&Queue::new("q", InMemoryBackend::new()));

        assert_eq!(request(&state, "/health").await.0, StatusCode::OK);
        assert_eq!(request(&state, "/_ah/health").await.0, StatusCode::OK);
        assert_eq!(request(&state, "/unknown").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn metrics_render_the_gauges() {
        let queue = Queue::new("backend-queue", InMemoryBackend::new());
        let state = state(&queue);
        state.worker.close().await;
        queue
            .job("refresh-feed", json!({}))
            .with_priority(10)
            .enqueue()
            .await
            .unwrap();

        let (status, body) = request(&state, "/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("# TYPE drover_queue_messages_prioritized gauge\n"));
        assert!(body.contains("drover_queue_messages_prioritized{queue=\"backend-queue\"} 1\n"));
        assert!(body.contains("drover_queue_messages_active{queue=\"backend-queue\"} 0\n"));
        assert!(!body.contains("read_position"));
    }

    #[tokio::test]
    async fn metrics_fail_when_the_broker_is_unavailable() {
        let queue = Queue::new("q", InMemoryBackend::new());
        let state = state(&queue);
        state.worker.close().await;
        queue.close().await.unwrap();

        let (status, body) = request(&state, "/metrics").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Broker unavailable"));
    }

    #[tokio::test]
    async fn prestop_stops_claiming() {
        let queue = Queue::new("q", InMemoryBackend::new());
        let state = state(&queue);

        assert_eq!(request(&state, "/lifecycle/prestop").await.0, StatusCode::OK);
        assert!(state.worker.is_draining());
        // Idempotent.
        assert_eq!(request(&state, "/lifecycle/prestop").await.0, StatusCode::OK);

        let id = queue.job("sync", json!({})).enqueue().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let job = queue.job_by_id(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
    }
}
