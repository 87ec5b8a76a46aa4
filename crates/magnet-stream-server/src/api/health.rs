use actix_web::{get, HttpResponse, Responder};
use magnet_stream_types::HealthResponse;

/// Liveness check.
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Server is running", body = HealthResponse)
    )
)]
#[get("/")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "running".to_string(),
    })
}
