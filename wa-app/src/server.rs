//! Site-side HTTP endpoint and the `doctor` check.
//!
//! `serve` exposes the local sandbox at `POST /wp-agent/v1/execute` behind the
//! access-key middleware so a remote `wpagent chat` can drive this site.

use crate::config::{SiteMode, WpAgentConfig};
use crate::http_auth::{self, AccessKeyPolicy, AccessKeyPolicyExt};
use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use wa_sandbox::{
    AssetType, ListAssetsArgs, Sandbox, SandboxAction, SandboxConfig, SandboxRequest,
    SandboxResponse,
};

pub const EXECUTE_PATH: &str = "/wp-agent/v1/execute";
pub const HEALTH_PATH: &str = "/wp-agent/v1/health";

pub fn open_local_sandbox(cfg: &WpAgentConfig) -> Result<Arc<Sandbox>> {
    let root = cfg.site_root()?;
    let database = cfg.site_database()?;
    let sandbox = Sandbox::new(SandboxConfig {
        root: root.clone(),
        database: database.clone(),
        table_prefix: cfg.site.table_prefix.clone(),
    })
    .map_err(|e| {
        anyhow::anyhow!(
            "open site at {} (database {}): {e}",
            root.display(),
            database.display()
        )
    })?;
    Ok(Arc::new(sandbox))
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = WpAgentConfig::load_with_path(config_path).await?;
    tracing::info!(
        model = %cfg.general.model,
        provider_base_url = %cfg.provider.base_url,
        provider_api_key_configured = cfg.api_key().is_ok(),
        site_mode = ?cfg.site.mode,
        auto_execute = cfg.general.auto_execute,
        config_path = %path.display(),
        "config ok"
    );
    if cfg.api_key().is_err() {
        tracing::warn!("no provider api key configured; `chat` will refuse to start");
    }

    match cfg.site.mode {
        SiteMode::Local => {
            let sandbox = open_local_sandbox(&cfg)?;
            for asset_type in [AssetType::Plugin, AssetType::Theme] {
                let listed = sandbox
                    .execute(&SandboxAction::ListAssets(ListAssetsArgs { asset_type }))
                    .await
                    .map_err(|e| anyhow::anyhow!("list {} assets: {e}", asset_type.as_str()))?;
                let count = listed["assets"].as_array().map(Vec::len).unwrap_or(0);
                tracing::info!(asset_type = asset_type.as_str(), count, "site assets ok");
            }
            let tables = sandbox
                .execute(&SandboxAction::GetDbTables(Default::default()))
                .await
                .map_err(|e| anyhow::anyhow!("list database tables: {e}"))?;
            tracing::info!(
                site_root = %sandbox.site().root().display(),
                tables = tables["tables"].as_array().map(Vec::len).unwrap_or(0),
                "site database ok"
            );
        }
        SiteMode::Remote => {
            tracing::info!(remote_url = %cfg.site.remote_url, "remote site configured");
        }
    }
    Ok(())
}

/// Builds the endpoint router. `/health` is open; `/execute` requires the
/// access key.
pub fn router(sandbox: Arc<Sandbox>, policy: AccessKeyPolicy) -> Router {
    let execute = Router::new()
        .route(EXECUTE_PATH, post(execute_action))
        .layer(axum::middleware::from_fn(http_auth::require_access_key))
        .layer(Extension(AccessKeyPolicyExt(Arc::new(policy))));

    Router::new()
        .route(HEALTH_PATH, get(health))
        .merge(execute)
        .layer(Extension(sandbox))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[tracing::instrument(level = "info", skip_all)]
async fn execute_action(
    Extension(sandbox): Extension<Arc<Sandbox>>,
    body: std::result::Result<Json<SandboxRequest>, JsonRejection>,
) -> (StatusCode, Json<SandboxResponse>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            tracing::warn!(error = %rejection, "malformed execute request");
            return (
                StatusCode::BAD_REQUEST,
                Json(SandboxResponse::failure(
                    "validation_error",
                    format!("malformed request: {}", rejection.body_text()),
                )),
            );
        }
    };
    tracing::info!(action = %request.action, "execute request accepted");
    (StatusCode::OK, Json(sandbox.handle(request).await))
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = WpAgentConfig::load_with_path(config_path).await?;
    let started_at = Instant::now();
    if cfg.site.mode != SiteMode::Local {
        return Err(anyhow::anyhow!(
            "serve exposes a local site; set site.mode = \"local\" in {}",
            cfg_path.display()
        ));
    }
    let addr = cfg.bind_addr()?;
    let policy = AccessKeyPolicy::new(&cfg.site.access_key)?;
    let sandbox = open_local_sandbox(&cfg)?;
    tracing::info!(
        bind_addr = %addr,
        site_root = %sandbox.site().root().display(),
        http_timeout_seconds = cfg.server.http_timeout_seconds,
        http_max_in_flight = cfg.server.http_max_in_flight,
        config_path = %cfg_path.display(),
        "serve configuration loaded"
    );

    let listener = preflight_bind_listener(addr).await?;
    let shutdown = CancellationToken::new();

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = router(sandbox, policy)
        .layer(GlobalConcurrencyLimitLayer::new(cfg.server.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.server.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(
        %addr,
        startup_ms = started_at.elapsed().as_millis() as u64,
        "wpagent serving"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
