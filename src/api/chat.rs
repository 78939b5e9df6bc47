use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde_json::{json, Value};
use tracing::warn;

use crate::core::AppState;
use crate::llm::{ping_qwen, ChatReply, ChatRequest};

use super::error::ApiError;

/// Always answers 200; failures are reported in the body.
pub async fn ping(State(state): State<AppState>) -> Json<Value> {
    let model_dir = state.config.qwen_model_path();
    let outcome = tokio::task::spawn_blocking(move || ping_qwen(&model_dir)).await;
    let body = match outcome {
        Ok(Ok(report)) => serde_json::to_value(report).unwrap_or_else(failure),
        Ok(Err(err)) => {
            warn!("Qwen ping failed: {err:#}");
            failure(format!("{err:#}"))
        }
        Err(err) => failure(err),
    };
    Json(body)
}

fn failure(error: impl ToString) -> Value {
    json!({ "ok": false, "error": error.to_string() })
}

pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
    let runtime = state.chat.clone();
    let reply = tokio::task::spawn_blocking(move || runtime.chat(&request)).await??;
    Ok(Json(reply))
}

/// Never loads the backend. An unconfigured runtime is reported in the body.
pub async fn info(State(state): State<AppState>) -> Json<Value> {
    let body = match state.chat.info() {
        Ok(info) => serde_json::to_value(info).unwrap_or_else(failure),
        Err(err) => failure(err),
    };
    Json(body)
}
