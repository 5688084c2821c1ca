use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use kaiwa_ai::GenerationClient;
use serde_json::json;
use tokio::net::TcpListener;

pub(crate) const HEALTH_PATH: &str = "/health";

pub(crate) fn build_health_router(generation: Arc<GenerationClient>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(handle_health))
        .with_state(generation)
}

async fn handle_health(State(generation): State<Arc<GenerationClient>>) -> Response {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "gemini_available": generation.is_available(),
        })),
    )
        .into_response()
}

/// Serves `app` until Ctrl-C.
pub(crate) async fn serve_http(listener: TcpListener, app: Router) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("failed to resolve http listen address")?;
    tracing::info!(addr = %local_addr, "http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server exited unexpectedly")
}
