//! HTTP request layer over [`RecordingService`]

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::service::{RecordingError, RecordingService, StopError};
use crate::session::Session;

type AppState = Arc<RecordingService>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartRequest {
    #[serde(default)]
    meeting_url: String,
    #[serde(default)]
    participant_name: String,
}

/// Error response with a JSON `{error, code}` body
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    error: String,
    code: &'static str,
    session: Option<Session>,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: message.into(),
            code: "INVALID_INPUT",
            session: None,
        }
    }
}

impl From<RecordingError> for ApiError {
    fn from(error: RecordingError) -> Self {
        Self {
            status: status_for(&error),
            code: error.code(),
            error: error.to_string(),
            session: None,
        }
    }
}

impl From<StopError> for ApiError {
    fn from(stop: StopError) -> Self {
        Self {
            session: stop.session,
            ..stop.error.into()
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({ "error": self.error, "code": self.code });
        if let Some(session) = self.session {
            body["session"] = json!(session);
        }
        (self.status, Json(body)).into_response()
    }
}

fn status_for(error: &RecordingError) -> StatusCode {
    match error {
        RecordingError::NotFound(_) => StatusCode::NOT_FOUND,
        RecordingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn router(service: Arc<RecordingService>) -> Router {
    Router::new()
        .route("/meetings/start", post(start_recording))
        .route("/meetings/stop/:session_id", post(stop_recording))
        .route("/meetings/status/:session_id", get(get_status))
        .route("/meetings/snapshot/:session_id", get(get_snapshot))
        .with_state(service)
}

/// Serve the API until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, service: Arc<RecordingService>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Listener has no local address")?;
    info!("HTTP API listening on {}", addr);

    axum::serve(listener, router(service))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")?;

    info!("HTTP API stopped");
    Ok(())
}

async fn start_recording(
    State(service): State<AppState>,
    request: Result<Json<StartRequest>, JsonRejection>,
) -> Result<Json<Session>, ApiError> {
    let Json(request) = request.map_err(|e| ApiError::bad_request(e.body_text()))?;
    debug!("Start requested for {}", request.meeting_url);

    let session = service.start_recording(&request.meeting_url, &request.participant_name)?;
    Ok(Json(session))
}

async fn stop_recording(
    State(service): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    match service.stop_recording(&session_id).await {
        Ok(session) => Ok(Json(session)),
        Err(e) => {
            warn!("Stop of session {} failed: {}", session_id, e);
            Err(e.into())
        }
    }
}

async fn get_status(
    State(service): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(service.get_status(&session_id)?))
}

async fn get_snapshot(
    State(service): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Response, ApiError> {
    let png = service.get_snapshot(&session_id).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png).into_response())
}
