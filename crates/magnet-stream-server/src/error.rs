//! Session and streaming errors, and their HTTP mapping.

use std::fmt;

use actix_web::http::{header, StatusCode};
use actix_web::HttpResponse;
use magnet_stream_types::ErrorResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionError {
    /// The identifier is not a magnet link (or info hash) we can parse.
    InvalidIdentifier,
    /// Acquisition exhausted its retries; the session has been removed.
    AcquisitionFailed(String),
    /// No live session for the identifier (never added, evicted, or failed).
    SessionNotFound,
    /// The session exists but metadata has not arrived yet.
    SessionNotReady,
    /// The session has no file with the requested name.
    FileNotFound,
    /// Malformed or out-of-bounds range for a file of `length` bytes.
    RangeNotSatisfiable { length: u64 },
    /// The byte source could not be opened or failed before headers were sent.
    StreamError(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::InvalidIdentifier => f.write_str("Invalid magnet link"),
            SessionError::AcquisitionFailed(reason) => {
                write!(f, "Failed to add torrent: {reason}")
            }
            SessionError::SessionNotFound => f.write_str("No active torrent for this identifier"),
            SessionError::SessionNotReady => f.write_str("Torrent metadata is not ready yet"),
            SessionError::FileNotFound => f.write_str("File not found in torrent"),
            SessionError::RangeNotSatisfiable { length } => {
                write!(f, "Requested range not satisfiable (file length {length})")
            }
            SessionError::StreamError(_) => f.write_str("Error in streaming file"),
        }
    }
}

impl SessionError {
    pub(crate) fn status(&self) -> StatusCode {
        match self {
            SessionError::InvalidIdentifier => StatusCode::BAD_REQUEST,
            SessionError::AcquisitionFailed(_) | SessionError::StreamError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            SessionError::SessionNotFound
            | SessionError::SessionNotReady
            | SessionError::FileNotFound => StatusCode::NOT_FOUND,
            SessionError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }

    /// Convert into a complete response. Only valid before any body bytes were sent.
    pub(crate) fn into_response(self) -> HttpResponse {
        match self {
            SessionError::RangeNotSatisfiable { length } => {
                HttpResponse::RangeNotSatisfiable()
                    .insert_header((header::ACCEPT_RANGES, "bytes"))
                    .insert_header((header::CONTENT_RANGE, format!("bytes */{length}")))
                    .finish()
            }
            other => HttpResponse::build(other.status()).json(ErrorResponse::new(other.to_string())),
        }
    }
}
