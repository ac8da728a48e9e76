//! HTTP surface of the router (axum).
//!
//! - `POST /process_job`: a job or a batch; always answers with a result body
//! - `POST /target`: target-plane messages
//! - `GET /status`: registry counts

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::Json;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use stowage_core::{ErrorKind, JobResult, Response, TargetMessage, TargetReply};

use crate::registry::ServerStatus;
use crate::router::JobRouter;

type AppState = Arc<JobRouter>;

pub fn app(router: AppState) -> axum::Router {
    let body_limit = router.config().max_body_bytes;
    axum::Router::new()
        .route("/process_job", post(process_job))
        .route("/target", post(target_message))
        .route("/status", get(status))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(router)
}

/// Serve until `shutdown` resolves, sweeping stale registry entries meanwhile.
pub async fn serve(
    router: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(router.config().listen).await?;
    serve_on(listener, router, shutdown).await
}

/// [`serve`] on a listener the caller already bound.
pub async fn serve_on(
    listener: TcpListener,
    router: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let every = Duration::from_secs(router.config().sweep_interval_secs.max(1));

    let sweeper = {
        let router = router.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                router.sweep().await;
            }
        })
    };

    tracing::info!("Listening on http://{}", listener.local_addr()?);
    let served = axum::serve(listener, app(router))
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper.abort();
    served
}

/// POST /process_job
async fn process_job(State(router): State<AppState>, body: Bytes) -> Json<Response> {
    let response = match serde_json::from_slice::<Value>(&body) {
        Ok(value) => router.handle_value(value).await,
        Err(e) => {
            tracing::warn!("Invalid job body: {}", e);
            Response::Single(JobResult::failed(
                "",
                ErrorKind::Structural,
                format!("invalid JSON: {e}"),
            ))
        }
    };
    Json(response)
}

/// POST /target
async fn target_message(
    State(router): State<AppState>,
    Json(message): Json<TargetMessage>,
) -> Json<TargetReply> {
    Json(router.handle_target(message).await)
}

/// GET /status
async fn status(State(router): State<AppState>) -> Json<ServerStatus> {
    Json(router.status().await)
}
