//! Actix server startup + app wiring.
//!
//! Builds the shared state, routes, middleware, and OpenAPI endpoints.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use actix_cors::Cors;
use actix_web::dev::{Service, ServiceRequest, ServiceResponse};
use actix_web::http::{header, Method, StatusCode};
use actix_web::{web, App, Error, HttpServer};
use anyhow::{Context, Result};
use futures_util::future::{ok, LocalBoxFuture, Ready};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::api;
use crate::config;
use crate::engine::local_store::LocalStoreEngine;
use crate::magnet::{info_hash_from_identifier, InfoHash, MagnetLink};
use crate::openapi;
use crate::state::AppState;

/// Build server state and start the Actix HTTP server.
pub(crate) async fn run(args: crate::Args) -> Result<()> {
    let mut cfg = load_config(args.config.as_ref())?;
    cfg.apply_env().context("apply environment overrides")?;
    let bind = resolve_bind(args.bind, &cfg)?;
    let content_dir = args
        .content_dir
        .unwrap_or_else(|| config::content_dir_from_config(&cfg));
    std::fs::create_dir_all(&content_dir)
        .with_context(|| format!("create content dir {}", content_dir.display()))?;
    let session_config = cfg.session_config();
    let shutdown_timeout = config::shutdown_timeout_from_config(&cfg);
    let cors_origins = config::cors_origins_from_config(&cfg);
    tracing::info!(
        bind = %bind,
        content_dir = %content_dir.display(),
        max_retries = session_config.max_retries,
        retry_base_delay_ms = session_config.retry_base_delay.as_millis() as u64,
        cleanup_delay_ms = session_config.cleanup_delay.as_millis() as u64,
        metadata_timeout_ms = ?session_config.metadata_timeout.map(|d| d.as_millis() as u64),
        "starting magnet-stream-server"
    );

    let engine = Arc::new(LocalStoreEngine::new(
        content_dir,
        config::poll_interval_from_config(&cfg),
    ));
    let state = web::Data::new(AppState::new(engine, session_config));
    let app_state = state.clone();

    HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(build_cors(cors_origins.as_deref()))
            .wrap(RequestLogger)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-doc/openapi.json", openapi::ApiDoc::openapi()),
            )
            .service(api::health_check)
            .service(api::sessions_list)
            .service(api::add_torrent)
            .service(api::stream_file)
    })
    .shutdown_timeout(shutdown_timeout.as_secs().max(1))
    .bind(bind)
    .with_context(|| format!("bind {bind}"))?
    .run()
    .await?;

    tracing::info!("http server stopped; disposing sessions");
    shutdown_sessions(&state, shutdown_timeout).await;
    Ok(())
}

/// Dispose every live session, giving up after `timeout`.
async fn shutdown_sessions(state: &AppState, timeout: Duration) {
    if tokio::time::timeout(timeout, state.sessions.shutdown())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_ms = timeout.as_millis() as u64,
            "session disposal timed out"
        );
    }
}

fn build_cors(origins: Option<&[String]>) -> Cors {
    let cors = match origins {
        Some(origins) => origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin)),
        None => Cors::default().allow_any_origin(),
    };
    cors.allowed_methods(vec!["GET", "HEAD", "OPTIONS"])
        .allowed_headers(vec![header::RANGE, header::CONTENT_TYPE])
        .expose_headers(vec![
            header::CONTENT_RANGE,
            header::ACCEPT_RANGES,
            header::CONTENT_LENGTH,
        ])
        .max_age(3600)
}

/// How loudly a request shows up in the access log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum AccessLog {
    Skip,
    Debug,
    Info,
}

fn access_log_for_path(path: &str) -> AccessLog {
    if path == "/" || path.starts_with("/swagger-ui/") {
        // health checks and static docs
        AccessLog::Skip
    } else if path.starts_with("/stream/") {
        // streams log their own lifecycle
        AccessLog::Debug
    } else {
        AccessLog::Info
    }
}

/// Info hash addressed by an `/add/…` or `/stream/…` request, if any.
fn info_hash_for_request(path: &str, query: &str) -> Option<InfoHash> {
    if let Some(identifier) = path.strip_prefix("/add/") {
        let raw = if query.is_empty() {
            identifier.to_string()
        } else {
            format!("{identifier}?{query}")
        };
        return MagnetLink::parse(&raw).map(|link| link.info_hash);
    }
    let identifier = path.strip_prefix("/stream/")?.split('/').next()?;
    info_hash_from_identifier(identifier)
}

/// Access log fields captured before the request is handed on.
struct RequestLine {
    method: Method,
    path: String,
    peer: String,
    info_hash: Option<InfoHash>,
    range: Option<String>,
    level: AccessLog,
}

impl RequestLine {
    fn from_request(req: &ServiceRequest) -> Self {
        let path = req.path().to_string();
        let level = access_log_for_path(&path);
        let info_hash = match level {
            AccessLog::Skip => None,
            _ => info_hash_for_request(&path, req.query_string()),
        };
        Self {
            method: req.method().clone(),
            peer: req
                .connection_info()
                .realip_remote_addr()
                .unwrap_or("-")
                .to_string(),
            range: req
                .headers()
                .get(header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            info_hash,
            path,
            level,
        }
    }

    fn log(&self, status: StatusCode, elapsed_ms: u128) {
        let info_hash = self.info_hash.as_ref().map(InfoHash::as_str).unwrap_or("-");
        match self.level {
            AccessLog::Skip => {}
            AccessLog::Debug => tracing::debug!(
                method = %self.method,
                path = %self.path,
                info_hash,
                range = self.range.as_deref().unwrap_or("-"),
                status = status.as_u16(),
                peer = %self.peer,
                elapsed_ms = %elapsed_ms,
                "http request"
            ),
            AccessLog::Info => tracing::info!(
                method = %self.method,
                path = %self.path,
                info_hash,
                status = status.as_u16(),
                peer = %self.peer,
                elapsed_ms = %elapsed_ms,
                "http request"
            ),
        }
    }
}

/// Actix middleware writing one access log line per request.
struct RequestLogger;

impl<S, B> actix_web::dev::Transform<S, ServiceRequest> for RequestLogger
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = RequestLoggerMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(RequestLoggerMiddleware { service })
    }
}

struct RequestLoggerMiddleware<S> {
    service: S,
}

impl<S, B> Service<ServiceRequest> for RequestLoggerMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let line = RequestLine::from_request(&req);
        let start = std::time::Instant::now();
        let fut = self.service.call(req);
        Box::pin(async move {
            let res = fut.await?;
            line.log(res.status(), start.elapsed().as_millis());
            Ok(res)
        })
    }
}

/// Load server config from `--config`, a `config.toml` beside the binary, or defaults.
fn load_config(path: Option<&PathBuf>) -> Result<config::ServerConfig> {
    if let Some(path) = path {
        return config::ServerConfig::load(path);
    }
    let auto_path = std::env::current_exe()
        .ok()
        .and_then(|path| path.parent().map(|dir| dir.join("config.toml")));
    match auto_path {
        Some(path) if path.exists() => {
            tracing::info!(path = %path.display(), "using config beside executable");
            config::ServerConfig::load(&path)
        }
        _ => Ok(config::ServerConfig::default()),
    }
}

/// Resolve the final bind address from args + config.
fn resolve_bind(bind: Option<SocketAddr>, cfg: &config::ServerConfig) -> Result<SocketAddr> {
    match bind {
        Some(addr) => Ok(addr),
        None => config::bind_from_config(cfg),
    }
}
