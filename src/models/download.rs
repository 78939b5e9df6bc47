use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use serde::Serialize;
use tar::Archive;
use tracing::{info, warn};
use zip::read::ZipArchive;

use crate::core::clock;

use super::{
    hub::ArtifactSource,
    manager::{ArchiveFormat, ArtifactDescriptor},
    metadata::{compute_sha256, dir_has_entries, is_materialized, write_marker, CompletionMarker},
};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    Ready,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtractAction {
    SkipExtract,
    Extracted,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactReport {
    pub name: String,
    pub status: ArtifactStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<ExtractAction>,
    pub zip_rel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_local: Option<String>,
    pub extract_to: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ArtifactReport {
    fn new(artifact: &ArtifactDescriptor, status: ArtifactStatus) -> Self {
        Self {
            name: artifact.name.clone(),
            status,
            action: None,
            zip_rel: artifact.remote.clone(),
            zip_local: None,
            extract_to: artifact.extract_to.display().to_string(),
            ts: clock::timestamp(),
            sha256: None,
            error: None,
        }
    }

    pub fn failed(artifact: &ArtifactDescriptor, error: &anyhow::Error) -> Self {
        let mut report = Self::new(artifact, ArtifactStatus::Error);
        report.error = Some(format!("{error:#}"));
        report
    }

    pub fn is_ready(&self) -> bool {
        self.status == ArtifactStatus::Ready
    }
}

/// Makes sure the artifact's contents exist at its extraction target.
///
/// A target carrying the completion marker is left alone and the source is
/// never contacted. Otherwise the archive is fetched when it is not already
/// staged, any partial target is cleared, the archive is unpacked and the
/// marker is written last.
pub fn ensure_artifact(
    artifact: &ArtifactDescriptor,
    dataset: &str,
    source: &dyn ArtifactSource,
) -> Result<ArtifactReport> {
    let mut report = ArtifactReport::new(artifact, ArtifactStatus::Ready);
    if is_materialized(&artifact.extract_to) {
        info!("{} already materialized at {}", artifact.name, report.extract_to);
        report.action = Some(ExtractAction::SkipExtract);
        return Ok(report);
    }

    let archive = fetch_archive(artifact, dataset, source)?;
    let checksum = compute_sha256(&archive)?;

    prepare_target(&artifact.extract_to)?;
    if let Err(error) = extract_archive(artifact.format, &archive, &artifact.extract_to) {
        // A corrupt archive would otherwise be reused on every retry.
        let _ = fs::remove_file(&archive);
        return Err(error.context(format!("extract {}", archive.display())));
    }
    write_marker(
        &artifact.extract_to,
        &CompletionMarker {
            archive: artifact.remote.clone(),
            sha256: checksum.clone(),
            extracted_at: clock::timestamp(),
        },
    )?;
    info!("Extracted {} into {}", artifact.name, report.extract_to);

    report.action = Some(ExtractAction::Extracted);
    report.zip_local = Some(archive.display().to_string());
    report.sha256 = Some(checksum);
    Ok(report)
}

/// Returns the staged archive, downloading it first when absent. The body
/// is written to a `.part` file and renamed only once complete.
fn fetch_archive(
    artifact: &ArtifactDescriptor,
    dataset: &str,
    source: &dyn ArtifactSource,
) -> Result<PathBuf> {
    let archive = artifact.archive_path.clone();
    if archive.is_file() {
        info!("Reusing staged archive {}", archive.display());
        return Ok(archive);
    }
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent).context("create staging directory")?;
    }

    let staging = staging_path(&archive);
    info!("Fetching {} from {dataset}", artifact.remote);
    let downloaded = match source.fetch_dataset_file(dataset, &artifact.remote, &staging) {
        Ok(bytes) => bytes,
        Err(error) => {
            let _ = fs::remove_file(&staging);
            return Err(error.context(format!("fetch {} from {dataset}", artifact.remote)));
        }
    };
    fs::rename(&staging, &archive)
        .with_context(|| format!("move {} into place", staging.display()))?;
    info!("Fetched {} ({downloaded} bytes)", archive.display());
    Ok(archive)
}

fn staging_path(archive: &Path) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    archive.with_file_name(name)
}

fn prepare_target(target: &Path) -> Result<()> {
    if dir_has_entries(target) {
        warn!(
            "Clearing incomplete extraction at {} (no completion marker)",
            target.display()
        );
        fs::remove_dir_all(target)
            .with_context(|| format!("remove incomplete target {}", target.display()))?;
    }
    fs::create_dir_all(target).context("create destination directory")?;
    Ok(())
}

pub fn extract_archive(format: ArchiveFormat, archive_path: &Path, destination: &Path) -> Result<()> {
    let file = File::open(archive_path).context("open archive")?;
    match format {
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(file), destination),
        ArchiveFormat::TarBz2 => extract_tar(BzDecoder::new(file), destination),
        ArchiveFormat::Zip => extract_zip(file, destination),
    }
}

fn extract_tar<R: Read>(reader: R, destination: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries().context("iterate tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        let unpacked = entry.unpack_in(destination).context("unpack tar entry")?;
        if !unpacked {
            let path = entry.path().map(|p| p.display().to_string()).unwrap_or_default();
            warn!("Skipped tar entry outside destination: {path}");
        }
    }
    Ok(())
}

fn extract_zip(file: File, destination: &Path) -> Result<()> {
    let mut archive = ZipArchive::new(file).context("open zip archive")?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("read zip entry")?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("Skipped zip entry outside destination: {}", entry.name());
            continue;
        };
        let dest = destination.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&dest).context("create zip dir")?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).context("create zip file parent")?;
            }
            let mut outfile = File::create(&dest).context("create zip file")?;
            io::copy(&mut entry, &mut outfile).context("write zip file")?;
        }
    }
    Ok(())
}
