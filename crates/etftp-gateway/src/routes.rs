use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{info, warn};

use etftp_transfer::{ClientConfig, TransferError, request_file};

#[derive(Clone)]
pub struct AppState {
    /// UDP address of the etftp server.
    pub server_addr: SocketAddr,
    pub client: Arc<ClientConfig>,
}

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub url: String,
}

/// GET /getImage?url=... Fetch the URL through the encrypted transfer and
/// return the bytes.
pub async fn get_image(
    State(state): State<AppState>,
    Query(query): Query<ImageQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    if query.url.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let server = state.server_addr;
    let client = state.client.clone();
    let url = query.url.clone();
    let download = tokio::task::spawn_blocking(move || request_file(server, &url, &client))
        .await
        .map_err(|e| {
            warn!("transfer task failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map_err(|e| {
            warn!(url = %query.url, "transfer failed: {}", e);
            status_for(&e)
        })?;

    info!(
        url = %query.url,
        "fetched {} bytes in {:.2}s ({} B/s, {} datagram bytes in, {} retransmit timeouts)",
        download.summary.bytes,
        download.summary.elapsed.as_secs_f64(),
        download.summary.throughput_bps,
        download.summary.bytes_in,
        download.summary.timeouts
    );

    let content_type = sniff_content_type(&download.data);
    Ok(([(header::CONTENT_TYPE, content_type)], download.data))
}

pub async fn health() -> &'static str {
    "ok"
}

// ── Helpers ─────────────────────────────────────────────────────────────

fn status_for(err: &TransferError) -> StatusCode {
    match err {
        TransferError::NotFound(_) => StatusCode::NOT_FOUND,
        TransferError::RetryExhausted { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}

fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        "image/png"
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        "image/gif"
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        "image/webp"
    } else {
        "application/octet-stream"
    }
}
