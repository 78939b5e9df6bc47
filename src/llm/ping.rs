use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use tokenizers::Tokenizer;

use crate::models::metadata::total_size;

const NVIDIA_GPUS: &str = "/proc/driver/nvidia/gpus";
const PROBE_TEXT: &str = "hello";
const PROBE_TOKENS: usize = 8;
const BYTES_PER_GB: f64 = 1e9;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeviceInfo {
    pub cuda: bool,
    pub device: String,
}

/// Reports the first NVIDIA GPU exposed by the driver, or the CPU.
pub fn detect_device() -> DeviceInfo {
    detect_device_in(Path::new(NVIDIA_GPUS))
}

fn detect_device_in(gpus: &Path) -> DeviceInfo {
    let first_gpu = fs::read_dir(gpus).ok().and_then(|entries| {
        let mut dirs: Vec<PathBuf> = entries.flatten().map(|entry| entry.path()).collect();
        dirs.sort();
        dirs.into_iter().next()
    });

    match first_gpu {
        Some(gpu) => {
            let model = fs::read_to_string(gpu.join("information"))
                .ok()
                .and_then(|info| {
                    info.lines()
                        .find_map(|line| line.strip_prefix("Model:").map(|m| m.trim().to_string()))
                })
                .unwrap_or_else(|| "cuda".into());
            DeviceInfo {
                cuda: true,
                device: model,
            }
        }
        None => DeviceInfo {
            cuda: false,
            device: "cpu".into(),
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PingReport {
    pub ok: bool,
    pub qwen_dir: String,
    pub size_gb: f64,
    pub shards: Vec<String>,
    pub config_model_type: Option<String>,
    pub tokenizer_vocab_size: usize,
    pub probe_tokens: Vec<u32>,
    pub cuda: bool,
    pub device: String,
}

/// Checks that a model directory is usable without loading weights: config
/// parses, tokenizer encodes a probe word, shards are listed.
pub fn ping_qwen(dir: &Path) -> Result<PingReport> {
    if !dir.is_dir() {
        bail!("Qwen dir missing: {}", dir.display());
    }

    let config_path = dir.join("config.json");
    let config: Value = serde_json::from_slice(
        &fs::read(&config_path).with_context(|| format!("read {}", config_path.display()))?,
    )
    .with_context(|| format!("parse {}", config_path.display()))?;
    let config_model_type = config
        .get("model_type")
        .and_then(Value::as_str)
        .map(str::to_string);

    let tokenizer_path = dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|err| anyhow!("load tokenizer {}: {err}", tokenizer_path.display()))?;
    let encoding = tokenizer
        .encode(PROBE_TEXT, false)
        .map_err(|err| anyhow!("encode probe text: {err}"))?;
    let probe_tokens = encoding.get_ids().iter().take(PROBE_TOKENS).copied().collect();

    let mut shards: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("list {}", dir.display()))?
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("model-") && name.ends_with(".safetensors"))
        .collect();
    shards.sort();

    let size_gb = (total_size(dir) as f64 / BYTES_PER_GB * 100.0).round() / 100.0;
    let device = detect_device();

    Ok(PingReport {
        ok: true,
        qwen_dir: dir.display().to_string(),
        size_gb,
        shards,
        config_model_type,
        tokenizer_vocab_size: tokenizer.get_vocab_size(false),
        probe_tokens,
        cuda: device.cuda,
        device: device.device,
    })
}
