//! HTTP routes and handlers

mod bootstrap;
mod chat;
pub mod error;
mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::AppState;

pub use bootstrap::CORE_BOOTSTRAP_JOB;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/configz", get(health::configz))
        .route("/bootstrap/plan", get(bootstrap::plan))
        .route("/bootstrap/download", post(bootstrap::download))
        .route("/bootstrap/download_async", post(bootstrap::download_async))
        .route("/bootstrap/status", get(bootstrap::status))
        .route("/bootstrap/qwen/plan", get(bootstrap::qwen_plan))
        .route("/bootstrap/qwen/download", post(bootstrap::qwen_download))
        .route("/qwen/ping", get(chat::ping))
        .route("/chat/qwen", post(chat::chat))
        .route("/chat/qwen/info", get(chat::info))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
