// src/api.rs
// Axum router for the server's public surface: the WebSocket endpoint on /
// plus the file transfer endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::files::{FileStore, MAX_UPLOAD_BYTES};
use crate::network::{self, SharedState};

#[derive(Clone)]
pub struct AppState {
    pub server: SharedState,
    pub files: Arc<FileStore>,
}

#[derive(Debug, Error)]
enum ApiError {
    #[error("file not found")]
    NotFound,

    #[error("storage error")]
    Io(std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "file not found".to_string()),
            ApiError::Io(e) => {
                error!("file store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
        };
        let body_json = json!({ "error": body });
        (status, Json(body_json)).into_response()
    }
}

pub fn router(server: SharedState, files: Arc<FileStore>) -> Router {
    Router::new()
        .route("/", get(ws_upgrade))
        .route("/api/upload", post(upload))
        .route("/downloads/:name", get(download))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(AppState { server, files })
}

async fn ws_upgrade(
    State(app): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| network::handle_session(app.server, socket, remote))
}

#[derive(Deserialize)]
struct UploadParams {
    name: Option<String>,
}

async fn upload(
    State(app): State<AppState>,
    Query(params): Query<UploadParams>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let url = app
        .files
        .store(params.name.as_deref(), &body)
        .await
        .map_err(ApiError::Io)?;
    Ok(Json(json!({ "file_url": url })))
}

async fn download(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    match app.files.read(&name).await {
        Some(bytes) => Ok((
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response()),
        None => Err(ApiError::NotFound),
    }
}
