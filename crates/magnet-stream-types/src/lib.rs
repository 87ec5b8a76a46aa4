use serde::{Deserialize, Serialize};

/// A single file exposed by an acquired torrent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct FileEntry {
    /// File name as reported by the transfer engine (used verbatim in stream URLs).
    pub name: String,
    /// File size in bytes.
    pub length: u64,
}

/// Response body for `GET /add/{identifier}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct AddResponse {
    /// Files available for streaming, in engine order.
    pub files: Vec<FileEntry>,
}

/// JSON error body returned by every failing endpoint.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ErrorResponse {
    /// Human-readable error message.
    pub error: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

/// Liveness check payload.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct HealthResponse {
    /// Always `running` while the process serves requests.
    pub status: String,
}

/// Lifecycle state of a torrent session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Metadata is still being acquired (possibly retrying).
    Pending,
    /// Metadata is available and files can be streamed.
    Ready,
    /// Acquisition exhausted its retries.
    Failed,
}

/// Point-in-time view of a live session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionSummary {
    /// Lowercase info hash identifying the session.
    pub info_hash: String,
    pub state: SessionState,
    /// Failed attempts since the last successful acquisition.
    pub retry_count: u32,
    /// Number of open consumer streams.
    pub ref_count: usize,
    /// Files, empty until the session is ready.
    pub files: Vec<FileEntry>,
    /// Milliseconds since the session last became idle, when idle.
    pub idle_for_ms: Option<u64>,
}

/// Response body for `GET /sessions`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct SessionsResponse {
    pub sessions: Vec<SessionSummary>,
}
