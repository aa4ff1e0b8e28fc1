//! HTTP front end for the gateway.
//!
//! `GET|POST /` takes the form parameters `alias`, `json`, `update` and
//! `cache`, runs the batch against the alias's pool and answers `200
//! text/plain` with the encoded results. Failures are reported in the body,
//! never through the status code. `GET|POST /flushCache` reloads the macro
//! cache.

use crate::db::{MacroCache, PoolRegistry, StatementExecutor};
use crate::error::{DbError, DbResult};
use crate::models::{StatementResult, encode_batch_result, error_body};
use crate::transport::Transport;
use axum::Router;
use axum::extract::{ConnectInfo, Form, FromRequest, Query, Request, State};
use axum::http::header::{CACHE_CONTROL, CONTENT_ENCODING, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::Deserialize;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Server-level settings taken from the config file.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub host: String,
    pub port: u16,
    pub use_gzip: bool,
    pub max_concurrent_requests: usize,
}

/// Request parameters, from the query string or a form body.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GatewayParams {
    pub alias: Option<String>,
    pub json: Option<String>,
    pub update: Option<String>,
    pub cache: Option<String>,
}

impl GatewayParams {
    /// Overlay `other` on top of `self`; fields present in `other` win.
    fn merge(self, other: Self) -> Self {
        Self {
            alias: other.alias.or(self.alias),
            json: other.json.or(self.json),
            update: other.update.or(self.update),
            cache: other.cache.or(self.cache),
        }
    }

    /// `Y`, `true` and `1` (any case) mean update mode.
    pub fn is_update(&self) -> bool {
        self.update.as_deref().is_some_and(|v| {
            v.eq_ignore_ascii_case("y") || v.eq_ignore_ascii_case("true") || v == "1"
        })
    }

    /// Cache lifetime in seconds; always zero for updates.
    pub fn cache_secs(&self) -> u32 {
        if self.is_update() {
            return 0;
        }
        self.cache
            .as_deref()
            .and_then(|v| v.trim().parse::<u32>().ok())
            .unwrap_or(0)
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<PoolRegistry>,
    executor: Arc<StatementExecutor>,
    macros: Arc<MacroCache>,
    workers: Arc<Semaphore>,
    use_gzip: bool,
}

/// HTTP transport implementation.
pub struct HttpTransport {
    state: AppState,
    host: String,
    port: u16,
}

impl HttpTransport {
    pub fn new(
        registry: Arc<PoolRegistry>,
        executor: Arc<StatementExecutor>,
        macros: Arc<MacroCache>,
        settings: HttpSettings,
    ) -> Self {
        Self {
            state: AppState {
                registry,
                executor,
                macros,
                workers: Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1))),
                use_gzip: settings.use_gzip,
            },
            host: settings.host,
            port: settings.port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Build the request router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", any(handle_statement))
            .route("/flushCache", any(handle_flush_cache))
            .with_state(self.state.clone())
    }
}

impl Transport for HttpTransport {
    async fn run(&self) -> DbResult<()> {
        let bind_addr = self.bind_addr();
        info!("Starting gateway HTTP server on {}", bind_addr);

        let app = self.router();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            DbError::config(format!("Failed to bind to {}: {}", bind_addr, e))
        })?;

        const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(30);

        let shutdown_notify = Arc::new(tokio::sync::Notify::new());
        let shutdown_notify_clone = shutdown_notify.clone();
        let shutdown_signal = async move {
            wait_for_signal().await;
            shutdown_notify_clone.notify_one();
        };

        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal);

        // In-flight batches may hold the server open; bound the wait.
        tokio::select! {
            result = server => {
                match result {
                    Ok(()) => info!("HTTP server stopped"),
                    Err(e) => {
                        error!(error = %e, "HTTP server error");
                        return Err(DbError::internal(format!("HTTP server error: {}", e)));
                    }
                }
            }
            _ = async {
                shutdown_notify.notified().await;
                info!(
                    timeout_secs = GRACEFUL_TIMEOUT.as_secs(),
                    "Waiting for requests to finish (send signal again to force exit)..."
                );

                tokio::select! {
                    _ = tokio::time::sleep(GRACEFUL_TIMEOUT) => {
                        warn!("Graceful shutdown timeout, forcing exit");
                    }
                    _ = wait_for_signal() => {
                        warn!("Received second signal, forcing immediate exit");
                    }
                }
            } => {}
        }

        info!("Closing database connections");
        let closed = self.state.registry.close_all().await;
        info!(closed, "Idle connections closed");

        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

async fn read_params(state: &AppState, method: &Method, uri: &Uri, request: Request) -> GatewayParams {
    let params = Query::<GatewayParams>::try_from_uri(uri)
        .map(|Query(p)| p)
        .unwrap_or_default();

    if method != Method::POST {
        return params;
    }
    match Form::<GatewayParams>::from_request(request, state).await {
        Ok(Form(body)) => params.merge(body),
        Err(rejection) => {
            warn!(error = %rejection, "Ignoring unreadable form body");
            params
        }
    }
}

fn client_ip(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string())
}

async fn handle_statement(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    request: Request,
) -> Response {
    let client = client_ip(&request);
    let params = read_params(&state, &method, &uri, request).await;
    let update = params.is_update();

    info!(
        target: "access",
        client = %client,
        method = %method,
        uri = %uri,
        gzip = state.use_gzip,
        alias = params.alias.as_deref().unwrap_or("-"),
        update,
        json = params.json.as_deref().unwrap_or("-"),
        "request"
    );

    let (Some(alias), Some(json)) = (params.alias.as_deref(), params.json.as_deref()) else {
        warn!("Malformed request");
        return respond(error_body("Malformed request"), 0, state.use_gzip);
    };

    let pool = match state.registry.get(alias) {
        Ok(pool) => pool,
        Err(e) => {
            warn!(alias = %alias, error = %e, "Rejected request");
            return respond(error_body(&e.to_string()), 0, state.use_gzip);
        }
    };

    let _permit = match state.workers.acquire().await {
        Ok(permit) => permit,
        Err(e) => {
            error!(error = %e, "Worker pool closed");
            return respond(error_body("Server is shutting down"), 0, state.use_gzip);
        }
    };

    let body = state.executor.execute_json(&pool, json, update).await;
    respond(body, params.cache_secs(), state.use_gzip)
}

async fn handle_flush_cache(State(state): State<AppState>) -> Response {
    let result = match state.macros.reload() {
        Ok(count) => {
            info!(count, "Macro cache flushed");
            let mut result = StatementResult::success();
            result.message = format!("Macro cache reloaded ({} macros)", count);
            result
        }
        Err(e) => {
            error!(error = %e, "Macro cache reload failed");
            StatementResult::from(&e)
        }
    };

    let body = encode_batch_result(&[result]).unwrap_or_else(|e| error_body(&e.to_string()));
    respond(body, 0, state.use_gzip)
}

/// Build a `200 text/plain` response with cache and encoding headers.
fn respond(body: String, cache_secs: u32, use_gzip: bool) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));

    let cache_control = if cache_secs > 0 {
        HeaderValue::from_str(&format!("public, max-age={}", cache_secs))
            .unwrap_or_else(|_| HeaderValue::from_static("no-cache"))
    } else {
        HeaderValue::from_static("no-cache")
    };
    headers.insert(CACHE_CONTROL, cache_control);

    if !use_gzip {
        return (StatusCode::OK, headers, body).into_response();
    }

    match gzip(body.as_bytes()) {
        Ok(compressed) => {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
            (StatusCode::OK, headers, compressed).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Cannot gzip response; sending it uncompressed");
            (StatusCode::OK, headers, body).into_response()
        }
    }
}

fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
