use std::{future::ready, sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{MatchedPath, Path, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use metrics_exporter_prometheus::PrometheusBuilder;
use thiserror::Error;
use tokio::net::ToSocketAddrs;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    context::JobRegistry,
    health::HealthRegistry,
    job::model::ImportJob,
    progress::{ProgressPublisher, ProgressSnapshot, ProgressSubscription},
    store::JobStore,
};

// Milliseconds, for the batch write and job duration histograms
const BUCKETS: &[f64] = &[
    1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0, 60000.0,
    300000.0,
];

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<dyn JobStore>,
    pub publisher: Arc<ProgressPublisher>,
    pub registry: JobRegistry,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("import {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(id) => {
                (StatusCode::NOT_FOUND, format!("import {id} not found")).into_response()
            }
            ApiError::Internal(e) => {
                error!("request failed: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
            }
        }
    }
}

pub async fn index() -> &'static str {
    "contact import worker"
}

pub fn router(state: ApiState, health: HealthRegistry) -> Router {
    let imports = Router::new()
        .route("/imports/:id", get(get_import))
        .route("/imports/:id/progress", get(stream_progress))
        .route("/imports/:id/cancel", post(cancel_import))
        .with_state(state);

    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(health.get_status())))
        .merge(imports)
}

async fn get_import(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ImportJob>, ApiError> {
    state
        .jobs
        .load_job(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound(id))
}

async fn cancel_import(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    if !state.registry.cancel(id, "cancelled by user") {
        return Err(ApiError::NotFound(id));
    }
    info!(job_id = %id, "cancellation requested");
    Ok(StatusCode::ACCEPTED)
}

type SnapshotStream = BoxStream<'static, Result<Event, axum::Error>>;

/// One event per published snapshot. A job that already finished gets its final
/// snapshot and nothing else.
async fn stream_progress(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> Result<Sse<SnapshotStream>, ApiError> {
    // Subscribe before loading so a terminal snapshot published in between isn't missed
    let subscription = Subscription {
        inner: Some(state.publisher.subscribe(id)),
        publisher: state.publisher.clone(),
        job_id: id,
    };

    let job = state
        .jobs
        .load_job(id)
        .await?
        .ok_or(ApiError::NotFound(id))?;

    let events: SnapshotStream = if job.status.is_terminal() {
        drop(subscription);
        stream::once(ready(snapshot_event(job.snapshot()))).boxed()
    } else {
        stream::unfold(subscription, |mut subscription| async move {
            let snapshot = subscription.next().await?;
            Some((snapshot_event(snapshot), subscription))
        })
        .boxed()
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn snapshot_event(snapshot: ProgressSnapshot) -> Result<Event, axum::Error> {
    Event::default()
        .event(snapshot.status.as_str())
        .json_data(snapshot)
}

// Gives the job's topic back to the publisher once the client goes away
struct Subscription {
    inner: Option<ProgressSubscription>,
    publisher: Arc<ProgressPublisher>,
    job_id: Uuid,
}

impl Subscription {
    async fn next(&mut self) -> Option<ProgressSnapshot> {
        self.inner.as_mut()?.next().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        drop(self.inner.take());
        self.publisher.release(self.job_id);
    }
}

/// Bind a `TcpListener` on the provided address to serve a `Router` on it.
pub async fn serve(router: Router, bind: impl ToSocketAddrs) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
/// Installs the global recorder, so only once per process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, anyhow::Error> {
    let recorder_handle = PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()?;

    Ok(router
        .route("/metrics", get(move || ready(recorder_handle.render())))
        .layer(axum::middleware::from_fn(track_metrics)))
}

async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
