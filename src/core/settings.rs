use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SERVICE_NAME: &str = "basaa-omni";

const ENV_PERSIST_DIR: &str = "PERSIST_DIR";
const ENV_DATASET: &str = "HF_DATASET";
const ENV_M2M_ZIP: &str = "M2M_ZIP";
const ENV_WSP_ZIP: &str = "WSP_ZIP";
const ENV_ORP_ZIP: &str = "ORP_ZIP";
const ENV_QWN_ZIP: &str = "QWN_ZIP";
const ENV_QWN_REPO: &str = "QWN_REPO";
const ENV_QWEN_PATH: &str = "QWEN_PATH";
const ENV_HF_TOKEN: &str = "HF_TOKEN";
const ENV_HF_ENDPOINT: &str = "HF_ENDPOINT";
const ENV_HOST: &str = "OMNI_HOST";
const ENV_PORT: &str = "OMNI_PORT";

const DEFAULT_PERSIST_DIR: &str = "/workspace";
const DEFAULT_DATASET: &str = "LeMisterIA/basaa-models";
const DEFAULT_M2M_ZIP: &str = "bundles/m2m100_bundle_20250817_155147.zip";
const DEFAULT_WSP_ZIP: &str = "bundles/whisper_bundle_20250817_163830.zip";
const DEFAULT_ORP_ZIP: &str = "bundles/orpheus_bundle_20250817_155147.zip";
const DEFAULT_QWN_REPO: &str = "Qwen/Qwen2.5-Omni-7B";
const DEFAULT_HF_ENDPOINT: &str = "https://huggingface.co";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

pub const M2M_DIR_NAME: &str = "m2m100_1p2b_basaa";
pub const WHISPER_DIR_NAME: &str = "whisper_large_v3_ct2";
pub const ORPHEUS_DIR_NAME: &str = "orpheus_3b_basaa";
pub const QWEN_DIR_NAME: &str = "qwen2_5_omni_7b";

/// Resolved service configuration. Everything is derived from the
/// persistent root plus environment overrides.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub persist_dir: PathBuf,
    pub dataset: String,
    pub m2m_zip: String,
    pub whisper_zip: String,
    pub orpheus_zip: String,
    pub qwen_zip: Option<String>,
    pub qwen_repo: String,
    pub qwen_path: Option<PathBuf>,
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,
    pub hf_endpoint: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source. Blank values
    /// are treated the same as missing ones.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        Self {
            persist_dir: PathBuf::from(
                read(ENV_PERSIST_DIR).unwrap_or_else(|| DEFAULT_PERSIST_DIR.into()),
            ),
            dataset: read(ENV_DATASET).unwrap_or_else(|| DEFAULT_DATASET.into()),
            m2m_zip: read(ENV_M2M_ZIP).unwrap_or_else(|| DEFAULT_M2M_ZIP.into()),
            whisper_zip: read(ENV_WSP_ZIP).unwrap_or_else(|| DEFAULT_WSP_ZIP.into()),
            orpheus_zip: read(ENV_ORP_ZIP).unwrap_or_else(|| DEFAULT_ORP_ZIP.into()),
            qwen_zip: read(ENV_QWN_ZIP),
            qwen_repo: read(ENV_QWN_REPO).unwrap_or_else(|| DEFAULT_QWN_REPO.into()),
            qwen_path: read(ENV_QWEN_PATH).map(PathBuf::from),
            hf_token: read(ENV_HF_TOKEN),
            hf_endpoint: read(ENV_HF_ENDPOINT)
                .map(|endpoint| endpoint.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_HF_ENDPOINT.into()),
        }
    }

    #[must_use]
    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = dir.into();
        self
    }

    pub fn persist_dir(&self) -> &Path {
        self.persist_dir.as_path()
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.persist_dir.join("bundles")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.persist_dir.join("models")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.persist_dir.join("cache")
    }

    /// Snapshot target for the multimodal model.
    pub fn qwen_dir(&self) -> PathBuf {
        self.models_dir().join(QWEN_DIR_NAME)
    }

    /// Directory the chat runtime loads from; `QWEN_PATH` wins over the
    /// snapshot target.
    pub fn qwen_model_path(&self) -> PathBuf {
        self.qwen_path.clone().unwrap_or_else(|| self.qwen_dir())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(ENV_HOST)
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HOST.into());
        let port = match lookup(ENV_PORT) {
            Some(raw) => match raw.trim().parse::<u16>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!("Invalid {ENV_PORT}='{raw}', falling back to {DEFAULT_PORT}");
                    DEFAULT_PORT
                }
            },
            None => DEFAULT_PORT,
        };
        Self { host, port }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_point_at_workspace() {
        let config = AppConfig::default();
        assert_eq!(config.persist_dir, PathBuf::from("/workspace"));
        assert_eq!(config.bundles_dir(), PathBuf::from("/workspace/bundles"));
        assert_eq!(config.models_dir(), PathBuf::from("/workspace/models"));
        assert_eq!(config.cache_dir(), PathBuf::from("/workspace/cache"));
        assert_eq!(config.dataset, "LeMisterIA/basaa-models");
        assert_eq!(config.qwen_repo, "Qwen/Qwen2.5-Omni-7B");
        assert!(config.qwen_zip.is_none());
        assert!(config.hf_token.is_none());
    }

    #[test]
    fn overrides_and_blank_values() {
        let config = AppConfig::from_lookup(lookup(&[
            ("PERSIST_DIR", "/data"),
            ("HF_DATASET", "org/models"),
            ("QWN_ZIP", "   "),
            ("HF_TOKEN", ""),
            ("HF_ENDPOINT", "http://mirror.local/"),
        ]));
        assert_eq!(config.models_dir(), PathBuf::from("/data/models"));
        assert_eq!(config.dataset, "org/models");
        assert!(config.qwen_zip.is_none());
        assert!(config.hf_token.is_none());
        assert_eq!(config.hf_endpoint, "http://mirror.local");
    }

    #[test]
    fn qwen_path_override_wins() {
        let config = AppConfig::from_lookup(lookup(&[("QWEN_PATH", "/opt/qwen")]));
        assert_eq!(config.qwen_model_path(), PathBuf::from("/opt/qwen"));
        assert_eq!(
            config.qwen_dir(),
            PathBuf::from("/workspace/models/qwen2_5_omni_7b")
        );
    }

    #[test]
    fn token_is_never_serialized() {
        let config = AppConfig::from_lookup(lookup(&[("HF_TOKEN", "secret")]));
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret"));
    }

    #[test]
    fn invalid_port_falls_back() {
        let server = ServerConfig::from_lookup(lookup(&[("OMNI_PORT", "nope")]));
        assert_eq!(server.port, 8000);
        assert_eq!(server.addr(), "0.0.0.0:8000");
    }
}
