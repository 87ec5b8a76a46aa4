use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use magnet_stream_types::{AddResponse, ErrorResponse};

use crate::error::SessionError;
use crate::magnet::MagnetLink;
use crate::state::AppState;

/// Rebuild the full identifier when an unencoded magnet's `?` split it into a query.
fn raw_identifier(identifier: &str, req: &HttpRequest) -> String {
    let query = req.query_string();
    if query.is_empty() {
        identifier.to_string()
    } else {
        format!("{identifier}?{query}")
    }
}

/// Add a magnet link and wait until its file list is known.
#[utoipa::path(
    get,
    path = "/add/{identifier}",
    params(
        ("identifier" = String, Path, description = "URL-encoded magnet URI")
    ),
    responses(
        (status = 200, description = "Files in the torrent", body = AddResponse),
        (status = 400, description = "Not a magnet link", body = ErrorResponse),
        (status = 500, description = "Acquisition failed after retries", body = ErrorResponse)
    )
)]
#[get("/add/{identifier:.*}")]
pub async fn add_torrent(
    state: web::Data<AppState>,
    req: HttpRequest,
    identifier: web::Path<String>,
) -> impl Responder {
    let raw = raw_identifier(&identifier, &req);
    let Some(magnet) = MagnetLink::parse(&raw) else {
        tracing::debug!(identifier = %raw, "rejected non-magnet identifier");
        return SessionError::InvalidIdentifier.into_response();
    };
    let info_hash = magnet.info_hash.clone();
    match state.sessions.add(magnet).await {
        Ok(files) => {
            tracing::info!(info_hash = %info_hash, files = files.len(), "torrent added");
            HttpResponse::Ok().json(AddResponse {
                files: files.to_vec(),
            })
        }
        Err(err) => {
            tracing::warn!(info_hash = %info_hash, error = %err, "add failed");
            err.into_response()
        }
    }
}
