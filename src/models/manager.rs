use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::{
    clock,
    settings::{AppConfig, M2M_DIR_NAME, ORPHEUS_DIR_NAME, WHISPER_DIR_NAME},
};

use super::{
    download::{ensure_artifact, ArtifactReport},
    hub::ArtifactSource,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ArchiveFormat {
    Zip,
    TarGz,
    TarBz2,
}

impl ArchiveFormat {
    /// Unknown suffixes are treated as zip, the format the dataset bundles use.
    pub fn from_filename(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            ArchiveFormat::TarBz2
        } else {
            ArchiveFormat::Zip
        }
    }
}

/// One downloadable bundle: where it lives remotely, where the archive is
/// staged locally and where its contents end up.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub remote: String,
    pub archive_path: PathBuf,
    pub extract_to: PathBuf,
    pub format: ArchiveFormat,
}

impl ArtifactDescriptor {
    pub fn new(name: &str, remote: &str, bundles_dir: &Path, extract_to: PathBuf) -> Self {
        Self {
            name: name.into(),
            remote: remote.into(),
            archive_path: bundles_dir.join(archive_file_name(remote)),
            extract_to,
            format: ArchiveFormat::from_filename(remote),
        }
    }
}

fn archive_file_name(remote: &str) -> String {
    Path::new(remote)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| remote.to_string())
}

/// The three bundles fetched by the core bootstrap, in processing order.
pub fn core_artifacts(config: &AppConfig) -> [ArtifactDescriptor; 3] {
    let bundles = config.bundles_dir();
    let models = config.models_dir();
    [
        ArtifactDescriptor::new("m2m", &config.m2m_zip, &bundles, models.join(M2M_DIR_NAME)),
        ArtifactDescriptor::new(
            "whisper",
            &config.whisper_zip,
            &bundles,
            models.join(WHISPER_DIR_NAME),
        ),
        ArtifactDescriptor::new(
            "orpheus",
            &config.orpheus_zip,
            &bundles,
            models.join(ORPHEUS_DIR_NAME),
        ),
    ]
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ArtifactPlan {
    pub zip: String,
    pub zip_local: String,
    pub extract_to: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotArtifactPlan {
    pub zip: String,
    pub zip_local: String,
    pub extract_to: String,
    pub hf_model_fallback: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlannedArtifacts {
    pub m2m: ArtifactPlan,
    pub whisper: ArtifactPlan,
    pub orpheus: ArtifactPlan,
    pub qwen: SnapshotArtifactPlan,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BootstrapPlan {
    pub persist_dir: String,
    pub bundles_dir: String,
    pub models_dir: String,
    pub cache_dir: String,
    pub dataset: String,
    pub artifacts: PlannedArtifacts,
}

impl From<&ArtifactDescriptor> for ArtifactPlan {
    fn from(artifact: &ArtifactDescriptor) -> Self {
        Self {
            zip: artifact.remote.clone(),
            zip_local: display(&artifact.archive_path),
            extract_to: display(&artifact.extract_to),
        }
    }
}

/// Resolves every artifact to its local paths. No filesystem access.
pub fn plan(config: &AppConfig) -> BootstrapPlan {
    let [m2m, whisper, orpheus] = core_artifacts(config);
    let qwen = SnapshotArtifactPlan {
        zip: config
            .qwen_zip
            .clone()
            .unwrap_or_else(|| "(none; pull from model repo)".into()),
        zip_local: config
            .qwen_zip
            .as_deref()
            .map(|zip| display(&config.bundles_dir().join(archive_file_name(zip))))
            .unwrap_or_else(|| "(n/a)".into()),
        extract_to: display(&config.qwen_dir()),
        hf_model_fallback: config.qwen_repo.clone(),
    };

    BootstrapPlan {
        persist_dir: display(config.persist_dir()),
        bundles_dir: display(&config.bundles_dir()),
        models_dir: display(&config.models_dir()),
        cache_dir: display(&config.cache_dir()),
        dataset: config.dataset.clone(),
        artifacts: PlannedArtifacts {
            m2m: ArtifactPlan::from(&m2m),
            whisper: ArtifactPlan::from(&whisper),
            orpheus: ArtifactPlan::from(&orpheus),
            qwen,
        },
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BootstrapReport {
    pub ts: String,
    pub dataset: String,
    pub reports: Vec<ArtifactReport>,
}

impl BootstrapReport {
    pub fn all_ready(&self) -> bool {
        self.reports.iter().all(ArtifactReport::is_ready)
    }
}

pub fn ensure_directories(config: &AppConfig) -> Result<()> {
    for dir in [
        config.persist_dir().to_path_buf(),
        config.bundles_dir(),
        config.models_dir(),
    ] {
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
    }
    Ok(())
}

/// Fetches and extracts every core bundle. A failing bundle is recorded in
/// its report and the remaining bundles are still attempted.
pub fn ensure_core_models(config: &AppConfig, source: &dyn ArtifactSource) -> Result<BootstrapReport> {
    ensure_directories(config)?;
    let artifacts = core_artifacts(config);
    let mut reports = Vec::with_capacity(artifacts.len());
    for artifact in &artifacts {
        match ensure_artifact(artifact, &config.dataset, source) {
            Ok(report) => reports.push(report),
            Err(error) => {
                warn!("Failed to bootstrap {}: {error:#}", artifact.name);
                reports.push(ArtifactReport::failed(artifact, &error));
            }
        }
    }
    let report = BootstrapReport {
        ts: clock::timestamp(),
        dataset: config.dataset.clone(),
        reports,
    };
    info!(
        "Core bootstrap finished for {} ({} artifacts, all ready: {})",
        report.dataset,
        report.reports.len(),
        report.all_ready()
    );
    Ok(report)
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::anyhow;
    use zip::write::{FileOptions, ZipWriter};

    use super::*;
    use crate::models::download::{ArtifactStatus, ExtractAction};

    fn config_for(root: &Path, overrides: &[(&str, &str)]) -> AppConfig {
        let map: HashMap<String, String> = overrides
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(move |key| map.get(key).cloned()).with_persist_dir(root)
    }

    /// Serves a one-file zip for every request, failing for names listed in
    /// `failing`.
    struct FakeDataset {
        calls: AtomicUsize,
        failing: Vec<&'static str>,
    }

    impl FakeDataset {
        fn new(failing: Vec<&'static str>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                failing,
            }
        }
    }

    impl ArtifactSource for FakeDataset {
        fn fetch_dataset_file(&self, _dataset: &str, filename: &str, dest: &Path) -> Result<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.iter().any(|name| filename.contains(name)) {
                return Err(anyhow!("simulated network failure for {filename}"));
            }
            let file = fs::File::create(dest)?;
            let mut writer = ZipWriter::new(file);
            writer.start_file("config.json", FileOptions::default())?;
            writer.write_all(br#"{"ok":true}"#)?;
            writer.finish()?;
            Ok(fs::metadata(dest)?.len())
        }
    }

    #[test]
    fn plan_resolves_artifact_paths() {
        let config = config_for(
            Path::new("/persist"),
            &[("HF_DATASET", "org/models"), ("M2M_ZIP", "bundles/x.zip")],
        );
        let plan = plan(&config);
        assert_eq!(plan.dataset, "org/models");
        assert_eq!(
            plan.artifacts.m2m.extract_to,
            display(&config.models_dir().join("m2m100_1p2b_basaa"))
        );
        assert_eq!(
            plan.artifacts.m2m.zip_local,
            display(&config.bundles_dir().join("x.zip"))
        );
        assert_eq!(plan.artifacts.m2m.zip, "bundles/x.zip");
        assert_eq!(plan.artifacts.qwen.zip_local, "(n/a)");
        assert_eq!(plan.artifacts.qwen.hf_model_fallback, "Qwen/Qwen2.5-Omni-7B");
    }

    #[test]
    fn plan_has_no_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("persist");
        let _ = plan(&config_for(&root, &[]));
        assert!(!root.exists());
    }

    #[test]
    fn archive_format_from_suffix() {
        assert_eq!(ArchiveFormat::from_filename("a/b.zip"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::from_filename("b.TAR.GZ"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::from_filename("b.tar.bz2"), ArchiveFormat::TarBz2);
        assert_eq!(ArchiveFormat::from_filename("bundle"), ArchiveFormat::Zip);
    }

    #[test]
    fn bootstrap_downloads_then_skips() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &[]);
        let source = FakeDataset::new(vec![]);

        let first = ensure_core_models(&config, &source).unwrap();
        assert!(first.all_ready());
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(first
            .reports
            .iter()
            .all(|report| report.action == Some(ExtractAction::Extracted)));

        let second = ensure_core_models(&config, &source).unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(second
            .reports
            .iter()
            .all(|report| report.action == Some(ExtractAction::SkipExtract)));
    }

    #[test]
    fn one_failing_artifact_does_not_stop_the_others() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_for(dir.path(), &[]);
        let source = FakeDataset::new(vec!["whisper"]);

        let report = ensure_core_models(&config, &source).unwrap();
        let statuses: Vec<_> = report
            .reports
            .iter()
            .map(|report| (report.name.as_str(), report.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("m2m", ArtifactStatus::Ready),
                ("whisper", ArtifactStatus::Error),
                ("orpheus", ArtifactStatus::Ready),
            ]
        );
        let failed = &report.reports[1];
        assert!(failed
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("simulated network failure"));
        assert!(!report.all_ready());
    }
}
