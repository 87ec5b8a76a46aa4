use actix_web::{get, web, HttpResponse, Responder};
use magnet_stream_types::SessionsResponse;

use crate::state::AppState;

/// List live sessions with their state, open streams, and idle time.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionsResponse)
    )
)]
#[get("/sessions")]
pub async fn sessions_list(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(SessionsResponse {
        sessions: state.sessions.snapshot(),
    })
}
