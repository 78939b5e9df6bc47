use std::{
    fs::{self, File},
    io::{Read, Write},
    path::Path,
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use serde::Deserialize;
use tracing::debug;

use crate::core::settings::AppConfig;

const USER_AGENT: &str = concat!("basaa-omni/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 32 * 1024;

/// Supplies single archive files out of a dataset repository.
pub trait ArtifactSource: Send + Sync {
    /// Writes `filename` from `dataset` to `dest`, returning the byte count.
    fn fetch_dataset_file(&self, dataset: &str, filename: &str, dest: &Path) -> Result<u64>;
}

/// Supplies whole model repositories file by file.
pub trait SnapshotSource: Send + Sync {
    fn list_repo_files(&self, repo: &str) -> Result<Vec<String>>;

    fn fetch_repo_file(&self, repo: &str, filename: &str, dest: &Path) -> Result<u64>;
}

/// A registry that serves both dataset archives and model repositories.
pub trait ModelRegistry: Send + Sync {
    fn artifacts(&self) -> &dyn ArtifactSource;

    fn snapshots(&self) -> &dyn SnapshotSource;
}

impl<T: ArtifactSource + SnapshotSource> ModelRegistry for T {
    fn artifacts(&self) -> &dyn ArtifactSource {
        self
    }

    fn snapshots(&self) -> &dyn SnapshotSource {
        self
    }
}

/// Opens a registry connection. Invoked on blocking threads only, since the
/// HTTP client may neither be built nor dropped inside the async runtime.
pub type RegistryFactory =
    Arc<dyn Fn(&AppConfig) -> Result<Box<dyn ModelRegistry>> + Send + Sync>;

pub fn hub_registry() -> RegistryFactory {
    Arc::new(|config: &AppConfig| {
        Ok(Box::new(HubClient::from_config(config)?) as Box<dyn ModelRegistry>)
    })
}

/// Blocking client for a Hugging Face compatible registry. Must be created
/// and used off the async executor.
pub struct HubClient {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    siblings: Vec<RepoSibling>,
}

#[derive(Debug, Deserialize)]
struct RepoSibling {
    rfilename: String,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()
            .context("create http client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(config.hf_endpoint.clone(), config.hf_token.clone())
    }

    pub fn dataset_file_url(&self, dataset: &str, filename: &str) -> String {
        format!("{}/datasets/{}/resolve/main/{}", self.endpoint, dataset, filename)
    }

    pub fn repo_file_url(&self, repo: &str, filename: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.endpoint, repo, filename)
    }

    pub fn repo_info_url(&self, repo: &str) -> String {
        format!("{}/api/models/{}", self.endpoint, repo)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        debug!("Downloading {url} -> {}", dest.display());
        let mut response = self
            .authorized(self.client.get(url))
            .send()
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .with_context(|| format!("download {url}"))?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context("create download directory")?;
        }
        let mut file = File::create(dest)
            .with_context(|| format!("create download file {}", dest.display()))?;
        let mut downloaded = 0u64;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = response.read(&mut buffer).context("read download chunk")?;
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .context("write download chunk")?;
            downloaded += read as u64;
        }
        file.flush().context("flush download file")?;
        Ok(downloaded)
    }
}

impl ArtifactSource for HubClient {
    fn fetch_dataset_file(&self, dataset: &str, filename: &str, dest: &Path) -> Result<u64> {
        let url = self.dataset_file_url(dataset, filename);
        self.download(&url, dest)
    }
}

impl SnapshotSource for HubClient {
    fn list_repo_files(&self, repo: &str) -> Result<Vec<String>> {
        let url = self.repo_info_url(repo);
        let info: RepoInfo = self
            .authorized(self.client.get(&url))
            .send()
            .with_context(|| format!("request {url}"))?
            .error_for_status()
            .with_context(|| format!("list files of {repo}"))?
            .json()
            .context("parse repository listing")?;
        Ok(info
            .siblings
            .into_iter()
            .map(|sibling| sibling.rfilename)
            .collect())
    }

    fn fetch_repo_file(&self, repo: &str, filename: &str, dest: &Path) -> Result<u64> {
        let url = self.repo_file_url(repo, filename);
        self.download(&url, dest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_registry_layout() {
        let hub = HubClient::new("https://hub.example/", None).unwrap();
        assert_eq!(
            hub.dataset_file_url("org/models", "bundles/x.zip"),
            "https://hub.example/datasets/org/models/resolve/main/bundles/x.zip"
        );
        assert_eq!(
            hub.repo_file_url("Qwen/Qwen2.5-Omni-7B", "config.json"),
            "https://hub.example/Qwen/Qwen2.5-Omni-7B/resolve/main/config.json"
        );
        assert_eq!(
            hub.repo_info_url("Qwen/Qwen2.5-Omni-7B"),
            "https://hub.example/api/models/Qwen/Qwen2.5-Omni-7B"
        );
    }

    #[test]
    fn repo_listing_parses_siblings() {
        let info: RepoInfo = serde_json::from_str(
            r#"{"id":"a/b","siblings":[{"rfilename":"config.json"},{"rfilename":"model-00001-of-00002.safetensors"}]}"#,
        )
        .unwrap();
        let names: Vec<_> = info.siblings.into_iter().map(|s| s.rfilename).collect();
        assert_eq!(names, vec!["config.json", "model-00001-of-00002.safetensors"]);
    }
}
