use actix_web::http::header;
use actix_web::{get, web, HttpRequest, Responder};
use magnet_stream_types::ErrorResponse;

use crate::error::SessionError;
use crate::magnet::info_hash_from_identifier;
use crate::state::AppState;

/// Stream one file of an added torrent, honouring a single `Range`.
#[utoipa::path(
    get,
    path = "/stream/{identifier}/{file_name}",
    params(
        ("identifier" = String, Path, description = "Info hash or URL-encoded magnet URI"),
        ("file_name" = String, Path, description = "File name as listed by /add"),
        ("Range" = Option<String>, Header, description = "Single byte range, e.g. bytes=0-1023")
    ),
    responses(
        (status = 200, description = "Full file", content_type = "application/octet-stream"),
        (status = 206, description = "Requested byte range", content_type = "application/octet-stream"),
        (status = 400, description = "Invalid identifier", body = ErrorResponse),
        (status = 404, description = "Unknown session or file", body = ErrorResponse),
        (status = 416, description = "Range not satisfiable"),
        (status = 500, description = "Byte source could not be opened", body = ErrorResponse)
    )
)]
#[get("/stream/{identifier}/{file_name:.*}")]
pub async fn stream_file(
    state: web::Data<AppState>,
    req: HttpRequest,
    path: web::Path<(String, String)>,
) -> impl Responder {
    let (identifier, file_name) = path.into_inner();
    let Some(info_hash) = info_hash_from_identifier(&identifier) else {
        return SessionError::InvalidIdentifier.into_response();
    };
    let session = match state.sessions.get(&info_hash) {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(info_hash = %info_hash, error = %err, "stream rejected");
            return err.into_response();
        }
    };

    let range_header = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    match state
        .streamer
        .serve(&session, &file_name, range_header)
        .await
    {
        Ok(resp) => resp,
        Err(err) => {
            tracing::debug!(
                info_hash = %info_hash,
                file = %file_name,
                error = %err,
                "stream rejected"
            );
            err.into_response()
        }
    }
}
