use std::{
    fs,
    path::{Component, Path, PathBuf},
    thread,
};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::unbounded;
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::Serialize;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::core::settings::AppConfig;

use super::{download::ArtifactStatus, hub::SnapshotSource};

pub const SNAPSHOT_WORKERS: usize = 4;

const WEIGHTS_INDEX: &str = "model.safetensors.index.json";
const WEIGHT_SHARDS: &[&str] = &["model-*.safetensors"];
const CONFIG_FILE: &str = "config.json";
const CODE_PATTERNS: &[&str] = &[
    "modeling_qwen2_5_omni.py",
    "configuration_qwen2_5_omni.py",
    "tokenization_qwen2_5_omni.py",
    "**/*qwen2*_omni*.py",
];
const ANY_CODE: &[&str] = &["**/*.py"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SnapshotPlan {
    pub repo: String,
    pub extract_to: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotAction {
    SkipExtract,
    Extracted,
    ExtractedCode,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub status: ArtifactStatus,
    pub action: SnapshotAction,
    pub path: String,
    pub repo: String,
    pub have_weights: bool,
    pub have_config: bool,
    pub have_code: bool,
    pub files_fetched: usize,
}

pub fn plan_qwen(config: &AppConfig) -> SnapshotPlan {
    SnapshotPlan {
        repo: config.qwen_repo.clone(),
        extract_to: config.qwen_dir().display().to_string(),
    }
}

pub fn ensure_qwen(config: &AppConfig, source: &dyn SnapshotSource) -> Result<SnapshotReport> {
    ensure_snapshot(&config.qwen_repo, &config.qwen_dir(), source)
}

/// Makes sure both the weights and the repository's Python support files
/// are present in `dest`. When only the code is missing, just the `*.py`
/// files are pulled.
pub fn ensure_snapshot(
    repo: &str,
    dest: &Path,
    source: &dyn SnapshotSource,
) -> Result<SnapshotReport> {
    fs::create_dir_all(dest).with_context(|| format!("create {}", dest.display()))?;

    let have_weights = has_weights(dest)?;
    let have_config = dest.join(CONFIG_FILE).is_file();
    let have_code = exists_any(dest, CODE_PATTERNS)?;

    let mut action = SnapshotAction::SkipExtract;
    let mut files_fetched = 0;
    let mut listing: Option<Vec<String>> = None;

    if !(have_weights && have_config) {
        info!("Pulling full snapshot of {repo} into {}", dest.display());
        let files = listing.insert(source.list_repo_files(repo)?);
        files_fetched += fetch_files(repo, dest, files.iter(), source)?;
        action = SnapshotAction::Extracted;
    }

    if !have_code {
        if listing.is_none() {
            listing = Some(source.list_repo_files(repo)?);
        }
        let files = listing.as_deref().unwrap_or_default();
        let code = glob_set(ANY_CODE)?;
        let code_files = files.iter().filter(|file| code.is_match(file.as_str()));
        info!("Pulling Python support files of {repo}");
        files_fetched += fetch_files(repo, dest, code_files, source)?;
        if action == SnapshotAction::SkipExtract {
            action = SnapshotAction::ExtractedCode;
        }
    }

    Ok(SnapshotReport {
        status: ArtifactStatus::Ready,
        action,
        path: dest.display().to_string(),
        repo: repo.to_string(),
        have_weights: has_weights(dest)?,
        have_config: dest.join(CONFIG_FILE).is_file(),
        have_code: exists_any(dest, ANY_CODE)?,
        files_fetched,
    })
}

fn has_weights(dest: &Path) -> Result<bool> {
    Ok(dest.join(WEIGHTS_INDEX).is_file() || exists_any(dest, WEIGHT_SHARDS)?)
}

/// Downloads the files that are not already on disk using a small pool of
/// worker threads. Returns how many files were fetched.
fn fetch_files<'a, I>(repo: &str, dest: &Path, files: I, source: &dyn SnapshotSource) -> Result<usize>
where
    I: Iterator<Item = &'a String>,
{
    let (job_tx, job_rx) = unbounded::<(String, PathBuf)>();
    let mut pending = 0;
    for file in files {
        let target = safe_join(dest, file)?;
        if target.exists() {
            debug!("Already present: {file}");
            continue;
        }
        pending += 1;
        let _ = job_tx.send((file.clone(), target));
    }
    drop(job_tx);
    if pending == 0 {
        return Ok(0);
    }

    let (err_tx, err_rx) = unbounded::<anyhow::Error>();
    thread::scope(|scope| {
        for _ in 0..SNAPSHOT_WORKERS.min(pending) {
            let job_rx = job_rx.clone();
            let err_tx = err_tx.clone();
            scope.spawn(move || {
                for (file, target) in job_rx.iter() {
                    if let Err(error) = fetch_one(repo, &file, &target, source) {
                        let _ = err_tx.send(error);
                    }
                }
            });
        }
    });
    drop(err_tx);

    let errors: Vec<anyhow::Error> = err_rx.iter().collect();
    if let Some(first) = errors.into_iter().next() {
        return Err(first.context(format!("snapshot of {repo} incomplete")));
    }
    Ok(pending)
}

fn fetch_one(repo: &str, file: &str, target: &Path, source: &dyn SnapshotSource) -> Result<()> {
    let mut staging = target.as_os_str().to_os_string();
    staging.push(".part");
    let staging = PathBuf::from(staging);
    match source.fetch_repo_file(repo, file, &staging) {
        Ok(bytes) => {
            fs::rename(&staging, target)
                .with_context(|| format!("move {} into place", target.display()))?;
            debug!("Fetched {file} ({bytes} bytes)");
            Ok(())
        }
        Err(error) => {
            let _ = fs::remove_file(&staging);
            Err(error.context(format!("fetch {file}")))
        }
    }
}

/// Joins a registry-provided relative name onto `dest`, refusing names that
/// would leave it.
fn safe_join(dest: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let clean = relative
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    if !clean || name.is_empty() {
        return Err(anyhow!("refusing repository path {name:?}"));
    }
    Ok(dest.join(relative))
}

/// Builds one matcher over `/`-separated paths relative to the snapshot
/// root. `*` stays within a single path segment; `**/` spans directories.
fn glob_set(patterns: &[&str]) -> Result<GlobSet> {
    patterns
        .iter()
        .map(|pattern| {
            GlobBuilder::new(pattern)
                .literal_separator(true)
                .build()
                .with_context(|| format!("compile glob {pattern}"))
        })
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .fold(&mut GlobSetBuilder::new(), |builder, glob| builder.add(glob))
        .build()
        .context("build glob set")
}

fn exists_any(dest: &Path, patterns: &[&str]) -> Result<bool> {
    let globs = glob_set(patterns)?;
    Ok(WalkDir::new(dest)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.path().strip_prefix(dest).ok().map(Path::to_path_buf))
        .any(|relative| globs.is_match(relative)))
}
