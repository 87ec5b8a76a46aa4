use utoipa::OpenApi;

use crate::api;
use magnet_stream_types as types;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::health::health_check,
        api::add::add_torrent,
        api::stream::stream_file,
        api::sessions::sessions_list,
    ),
    components(
        schemas(
            types::FileEntry,
            types::AddResponse,
            types::ErrorResponse,
            types::HealthResponse,
            types::SessionState,
            types::SessionSummary,
            types::SessionsResponse,
        )
    ),
    tags(
        (name = "magnet-stream-server", description = "Magnet link streaming API")
    )
)]
pub struct ApiDoc;
