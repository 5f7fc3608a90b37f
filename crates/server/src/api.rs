//! HTTPS signing API
//!
//! Three routes: the wildcard chain download, the raw signing endpoint, and
//! the HTTP-01 challenge resource. Routing matches on path suffix only;
//! host enforcement happens earlier, at the mTLS/SNI layer. Handlers are
//! fully stateless; callers are trusted mTLS peers, so there is no per-key
//! rate limiting.

use crate::acme::broker::ChallengeBroker;
use crate::keys::{HashAlg, KeyStore, MAX_DIGEST_LEN};
use axum::body::Bytes;
use axum::extract::{Host, Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::{Handle, HttpConfig};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared request state.
#[derive(Clone)]
pub struct ApiState {
    pub keys: Arc<KeyStore>,
    pub broker: Arc<ChallengeBroker>,
    pub certificate_path: PathBuf,
}

/// Build the API router under the configured path prefix.
pub fn router(state: ApiState, path_prefix: &str) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/:token", get(acme_challenge))
        .route(&format!("{path_prefix}/certificate"), get(certificate))
        .route(&format!("{path_prefix}/sign"), post(sign))
        .with_state(state)
}

// ============================================================================
// Handlers
// ============================================================================

/// `GET <prefix>/certificate`: the wildcard chain PEM, verbatim.
async fn certificate(State(state): State<ApiState>) -> Response {
    match tokio::fs::read(&state.certificate_path).await {
        Ok(chain) => (
            [(header::CONTENT_TYPE, "application/pem-certificate-chain")],
            chain,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            StatusCode::NOT_FOUND.into_response()
        }
        Err(e) => {
            error!(error = %e, "failed to read certificate chain");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignQuery {
    #[serde(default)]
    key: String,
    #[serde(default)]
    hash: String,
}

/// `POST <prefix>/sign?key=<fingerprint>&hash=<name>`: sign a raw digest.
async fn sign(
    State(state): State<ApiState>,
    Query(query): Query<SignQuery>,
    body: Bytes,
) -> Response {
    let Some(signer) = state.keys.lookup(&query.key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // An empty hash name means "no pre-hash" (Ed25519-style signing).
    let hash = if query.hash.is_empty() {
        None
    } else {
        match HashAlg::by_name(&query.hash) {
            Some(hash) => Some(hash),
            None => return StatusCode::NOT_FOUND.into_response(),
        }
    };

    if body.is_empty() || body.len() > MAX_DIGEST_LEN {
        return StatusCode::BAD_REQUEST.into_response();
    }

    match signer.sign(&body, hash) {
        Ok(signature) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            signature,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "signing failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /.well-known/acme-challenge/<token>`: HTTP-01 key authorization.
async fn acme_challenge(
    State(state): State<ApiState>,
    Host(host): Host,
    UrlPath(token): UrlPath<String>,
) -> Response {
    match state
        .broker
        .http_key_authorization(&token, strip_port(&host))
    {
        Some(key_authorization) => key_authorization.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Serve the router over TLS until shutdown.
///
/// On shutdown in-flight connections are drained gracefully, bounded only by
/// the administrator's patience.
pub async fn serve(
    listener: std::net::TcpListener,
    tls: Arc<rustls::ServerConfig>,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "https server listening");

    let handle = Handle::new();
    let drainer = handle.clone();
    tokio::spawn(async move {
        let _ = shutdown.changed().await;
        info!("draining in-flight connections");
        drainer.graceful_shutdown(None);
    });

    let http_config = HttpConfig::new()
        .http1_header_read_timeout(READ_HEADER_TIMEOUT)
        .build();

    let served = axum_server::from_tcp_rustls(listener, RustlsConfig::from_config(tls))
        .handle(handle)
        .http_config(http_config)
        .serve(app.into_make_service())
        .await;
    if let Err(e) = served {
        error!(error = %e, "https server terminated");
    }
    info!("https server stopped");
}
