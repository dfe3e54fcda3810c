//! HTTPS server for the admission webhook
//!
//! Routes:
//! - `POST /mutate` - AdmissionReview in, AdmissionReview out
//! - `GET /healthz` - liveness, empty 200

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sidecar_injector_common::MUTATE_PATH;

use crate::config::InjectorDefaults;
use crate::mutation::validate;
use crate::review::{self, ReviewError};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Failures of the server itself
#[derive(Debug, Error)]
pub enum ServerError {
    /// Certificate or key could not be loaded
    #[error("failed to load TLS material: {0}")]
    Tls(#[source] std::io::Error),

    /// Bind or accept failure
    #[error("webhook server error: {0}")]
    Serve(#[source] std::io::Error),
}

/// Request rejected before reaching the mutation engine
#[derive(Debug, Error)]
pub enum RequestError {
    /// Content-Type is not JSON
    #[error("invalid Content-Type {0:?}, expected application/json")]
    ContentType(String),

    /// No body
    #[error("empty body")]
    EmptyBody,

    /// Envelope could not be decoded
    #[error(transparent)]
    Review(#[from] ReviewError),

    /// Response could not be encoded
    #[error("failed to encode admission response: {0}")]
    Encode(#[source] serde_json::Error),
}

impl IntoResponse for RequestError {
    fn into_response(self) -> Response {
        let status = match &self {
            RequestError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        warn!(error = %self, "rejecting admission request");
        (status, self.to_string()).into_response()
    }
}

/// Listen address and TLS files
#[derive(Clone, Debug)]
pub struct WebhookServerConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// PEM certificate chain
    pub cert_file: PathBuf,
    /// PEM private key
    pub key_file: PathBuf,
}

#[derive(Clone)]
struct AppState {
    defaults: Arc<InjectorDefaults>,
}

/// Build the webhook router
pub fn router(defaults: Arc<InjectorDefaults>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_handler))
        .route("/healthz", get(|| async { StatusCode::OK }))
        .with_state(AppState { defaults })
}

async fn mutate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, RequestError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with("application/json") {
        return Err(RequestError::ContentType(content_type.to_string()));
    }
    if body.is_empty() {
        return Err(RequestError::EmptyBody);
    }

    let request = review::from_slice(&body)?;
    debug!(
        uid = %request.uid,
        version = request.version.api_version(),
        kind = %request.kind.kind,
        "admission request received"
    );

    let version = request.version;
    let response = validate(&request, &state.defaults);
    let envelope = response.into_review(version).map_err(RequestError::Encode)?;
    Ok(Json(envelope))
}

/// Serve until `shutdown` fires, then drain in-flight requests
pub async fn serve(
    config: WebhookServerConfig,
    defaults: InjectorDefaults,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let tls = RustlsConfig::from_pem_file(&config.cert_file, &config.key_file)
        .await
        .map_err(ServerError::Tls)?;

    let handle = Handle::new();
    let watcher = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("shutting down webhook server");
        watcher.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    info!(addr = %config.addr, "starting webhook server");
    axum_server::bind_rustls(config.addr, tls)
        .handle(handle)
        .serve(router(Arc::new(defaults)).into_make_service())
        .await
        .map_err(ServerError::Serve)
}
