//! HTTP submission adapter.
//!
//! Thin collaborator over the core: validates uploads, translates core errors
//! to status codes, and exposes the status/result polling endpoints. All
//! durable-execution logic stays behind [`JobService`].

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tally_core::{CoreError, JobId, JobOutcome, JobService};
use tokio::{net::TcpListener, sync::watch, task::JoinHandle};

#[derive(Clone)]
struct AppState {
    service: Arc<JobService>,
}

pub struct ApiServer {
    pub addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<anyhow::Result<()>>,
}

impl ApiServer {
    pub async fn start(service: Arc<JobService>, bind: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("bind api server to {bind}"))?;
        let addr = listener.local_addr().context("api server local_addr")?;

        let app = router(service);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(serve(listener, app, shutdown_rx));

        Ok(Self {
            addr,
            shutdown_tx,
            join,
        })
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown_tx.send(true);
        self.join.await.context("join api server task")??;
        Ok(())
    }
}

async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            while !*shutdown_rx.borrow() {
                if shutdown_rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .context("serve api")?;
    Ok(())
}

pub fn router(service: Arc<JobService>) -> Router {
    // The handler owns the 413 decision, so the transport-level cap sits well
    // above MAX_TEXT_BYTES (multipart framing included).
    let body_limit = service.max_text_bytes().saturating_mul(4).max(1 << 20);
    let state = AppState { service };
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/:id/status", get(job_status))
        .route("/jobs/:id/result", get(job_result))
        .route("/healthz", get(healthz))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

async fn submit_job(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Response> {
    let mut payload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("malformed multipart body: {err}")))?
    {
        if field.file_name().is_some() || field.name() == Some("file") {
            let bytes = field
                .bytes()
                .await
                .map_err(|err| ApiError::bad_request(format!("unreadable upload: {err}")))?;
            payload = Some(bytes);
            break;
        }
    }

    let Some(bytes) = payload else {
        return Err(ApiError::bad_request(
            "multipart body has no file field".to_string(),
        ));
    };

    if bytes.len() > state.service.max_text_bytes() {
        return Err(ApiError::payload_too_large(
            bytes.len(),
            state.service.max_text_bytes(),
        ));
    }

    let text = String::from_utf8(bytes.to_vec())
        .map_err(|_| ApiError::bad_request("upload is not valid UTF-8".to_string()))?;

    let id = state.service.submit(text).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "job_id": id, "status": "pending" })),
    )
        .into_response())
}

async fn job_status(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let id = parse_job_id(&raw_id)?;
    let view = state.service.status_of(id).await?;
    Ok(Json(json!({
        "job_id": view.id,
        "status": view.status,
        "attempts": view.attempts,
        "created_at": view.created_at,
        "updated_at": view.updated_at,
    })))
}

async fn job_result(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> ApiResult<Response> {
    let id = parse_job_id(&raw_id)?;
    let outcome = state.service.result_of(id).await?;

    let response = match outcome {
        JobOutcome::Done { chars } => (
            StatusCode::OK,
            Json(json!({ "job_id": id, "status": "done", "characters": chars })),
        ),
        JobOutcome::InProgress { status } => (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": id, "status": status, "detail": "Result not ready" })),
        ),
        JobOutcome::Failed { attempts, error } => (
            StatusCode::CONFLICT,
            Json(json!({ "job_id": id, "status": "failed", "attempts": attempts, "error": error })),
        ),
    };
    Ok(response.into_response())
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// The id space is opaque to clients, so a malformed id is indistinguishable
/// from an unknown one: both are 404.
fn parse_job_id(raw: &str) -> ApiResult<JobId> {
    raw.parse().map_err(|_| ApiError::unknown_job(raw))
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }

    fn unknown_job(raw_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: format!("unknown job {raw_id}"),
        }
    }

    fn payload_too_large(got: usize, limit: usize) -> Self {
        Self {
            status: StatusCode::PAYLOAD_TOO_LARGE,
            message: format!("upload is {got} bytes, limit is {limit}"),
        }
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        tracing::error!(error = %err, "api internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(id) => Self::unknown_job(&id.to_string()),
            CoreError::InvalidInput(message) => Self::bad_request(message),
            other => Self::internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}
