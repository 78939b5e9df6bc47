use axum::{extract::State, Json};
use serde::Serialize;

use crate::core::{AppState, APP_VERSION, SERVICE_NAME};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    /// Snapshot config is on disk.
    pub qwen: bool,
    /// Tokenizer is on disk, so a ping can succeed.
    pub qwen_ping: bool,
    /// A chat backend is configured.
    pub qwen_chat: bool,
}

pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    let model_dir = state.config.qwen_model_path();
    Json(HealthResponse {
        ok: true,
        service: SERVICE_NAME,
        version: APP_VERSION,
        qwen: model_dir.join("config.json").is_file(),
        qwen_ping: model_dir.join("tokenizer.json").is_file(),
        qwen_chat: state.chat.is_configured(),
    })
}

#[derive(Debug, Serialize)]
pub struct ConfiguredZips {
    pub m2m: String,
    pub whisper: String,
    pub orpheus: String,
    pub qwen: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub hf_dataset: String,
    pub zips: ConfiguredZips,
    pub qwen_repo: String,
}

pub async fn configz(State(state): State<AppState>) -> Json<ConfigResponse> {
    let config = &state.config;
    Json(ConfigResponse {
        hf_dataset: config.dataset.clone(),
        zips: ConfiguredZips {
            m2m: config.m2m_zip.clone(),
            whisper: config.whisper_zip.clone(),
            orpheus: config.orpheus_zip.clone(),
            qwen: config.qwen_zip.clone(),
        },
        qwen_repo: config.qwen_repo.clone(),
    })
}
