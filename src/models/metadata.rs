use std::{
    fs::{self, File},
    io::{BufReader, Read},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Written into an extraction target once every entry has been unpacked.
pub const COMPLETION_MARKER: &str = ".bootstrap-complete";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompletionMarker {
    pub archive: String,
    pub sha256: String,
    pub extracted_at: String,
}

pub fn compute_sha256(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("open file for hashing: {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader.read(&mut buffer).context("hash read")?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    let hash = hasher.finalize();
    Ok(format!("{:x}", hash))
}

pub fn marker_path(target: &Path) -> PathBuf {
    target.join(COMPLETION_MARKER)
}

/// An artifact counts as materialized only when its marker is present.
pub fn is_materialized(target: &Path) -> bool {
    marker_path(target).is_file()
}

pub fn write_marker(target: &Path, marker: &CompletionMarker) -> Result<()> {
    let path = marker_path(target);
    let serialized = serde_json::to_vec_pretty(marker).context("serialize completion marker")?;
    fs::write(&path, serialized)
        .with_context(|| format!("write completion marker {}", path.display()))?;
    Ok(())
}

pub fn read_marker(target: &Path) -> Option<CompletionMarker> {
    let bytes = fs::read(marker_path(target)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub fn dir_has_entries(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

pub fn total_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}
