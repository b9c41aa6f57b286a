//! HTTP status endpoint for load balancers and operators.

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::AuthServer;
use crate::ca::CaDomain;
use crate::GIT_COMMIT_HASH;

pub fn router(auth: AuthServer) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(auth)
        .layer(TraceLayer::new_for_http())
}

/// Serve [`router`] on `listener` until `shutdown` fires.
///
/// # Errors
/// Returns an error if the server fails while running.
pub async fn serve(
    listener: TcpListener,
    auth: AuthServer,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("health endpoint listening on http://{addr}/health");
    }
    axum::serve(listener, router(auth))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

// Healthy once both certificate authorities exist.
async fn health(State(auth): State<AuthServer>) -> impl IntoResponse {
    let host_ca = auth.ca().is_initialized(CaDomain::Host).await;
    let user_ca = auth.ca().is_initialized(CaDomain::User).await;
    let body = Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "build": GIT_COMMIT_HASH,
        "host_ca": host_ca,
        "user_ca": user_ca,
    }));

    let short_hash = GIT_COMMIT_HASH.get(0..7).unwrap_or("");
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!(
        "{}:{}:{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        short_hash
    )) {
        headers.insert("X-App", value);
    }

    let status = if host_ca && user_ca {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, headers, body)
}
