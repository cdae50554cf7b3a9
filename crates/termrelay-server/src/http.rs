use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use libtermrelay::{DownloadReply, FrontEndHandle};
use serde::Deserialize;
use termrelay_protocol::TerminalId;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{debug, warn};

use crate::server::ConnectionIds;
use crate::ws;

pub struct AppState {
    pub front_end: FrontEndHandle,
    pub client_ids: ConnectionIds,
}

pub fn router(
    state: Arc<AppState>,
    static_dir: &Path,
    allow_origins: &[String],
) -> anyhow::Result<Router> {
    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/download", get(download))
        .fallback_service(ServeDir::new(static_dir))
        .with_state(state);

    if allow_origins.is_empty() {
        Ok(app)
    } else {
        Ok(app.layer(build_cors(allow_origins)?))
    }
}

fn build_cors(origins: &[String]) -> anyhow::Result<CorsLayer> {
    if origins.iter().any(|o| o == "*") {
        return Ok(CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::OPTIONS])
            .allow_headers(Any));
    }

    let mut headers = Vec::with_capacity(origins.len());
    for origin in origins {
        headers.push(
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid allow_origins value: {origin}"))?,
        );
    }

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list(headers))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any))
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    terminal_id: TerminalId,
    path: String,
    token: String,
}

async fn download(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DownloadQuery>,
) -> Response {
    let filename = attachment_name(&query.path);
    let reply = state.front_end.download(query.token, query.terminal_id, query.path);

    match reply.await {
        Ok(DownloadReply::Stream {
            content_length,
            body,
        }) => {
            debug!(terminal_id = query.terminal_id, content_length, "download started");
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, content_length)
                .header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{filename}\""),
                )
                .body(Body::from_stream(ReceiverStream::new(body)))
                .unwrap_or_else(|e| {
                    warn!("failed to build download response: {e}");
                    StatusCode::INTERNAL_SERVER_ERROR.into_response()
                })
        }
        Ok(DownloadReply::NotFound) | Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Last path component, safe to put inside a quoted header parameter.
fn attachment_name(path: &str) -> String {
    let name = path
        .rsplit('/')
        .find(|part| !part.is_empty())
        .unwrap_or("download");
    name.chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect()
}
