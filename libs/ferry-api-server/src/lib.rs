mod http;
pub mod tools;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;

use ferry_engine::Relay;

pub use tools::{DispatchError, ToolError, ToolResponse, dispatch};

#[derive(Debug, thiserror::Error)]
pub enum ApiServerError {
    #[error("bind api :{port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("axum serve: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Clone)]
pub(crate) struct AppState {
    relay: Relay,
    prefix: Arc<str>,
}

/// Routes of the tool-call API, without a listener.
pub fn router(relay: Relay, prefix: &str) -> Router {
    let state = AppState {
        relay,
        prefix: Arc::from(prefix),
    };

    Router::new()
        .route("/api/tools", get(http::handle_list_tools))
        .route("/api/tools/{name}", post(http::handle_call_tool))
        .route("/api/status", get(http::handle_status))
        .with_state(state)
}

/// Serve the tool-call API on `port` until `shutdown` is cancelled.
pub async fn run(
    port: u16,
    relay: Relay,
    prefix: &str,
    shutdown: CancellationToken,
) -> Result<(), ApiServerError> {
    let app = router(relay, prefix);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|source| ApiServerError::Bind { port, source })?;

    tracing::info!(port, prefix, "tool API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(ApiServerError::Serve)?;

    Ok(())
}
