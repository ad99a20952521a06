/// Step result cache
///
/// Host results live in a local directory per step id:
/// `<cache>/<id>/metadata.json` plus `<cache>/<id>/output.tar.zst`.
/// Container results are their tagged result images (see [`ImageCache`]).
/// Entries are only ever written after a successful run, and are written to a
/// temporary directory first and renamed into place, so a concurrent writer of
/// the same id (which produces the same content) can only win or lose whole.
pub mod archive;
pub mod image;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::CacheError;
use crate::runner::reset_dir;
use crate::step::{Step, StepId};

pub use archive::ArchivedOutput;
pub use image::ImageCache;

const METADATA_FILE: &str = "metadata.json";
const ARCHIVE_FILE: &str = "output.tar.zst";
const METADATA_VERSION: u32 = 1;

/// Cache entry metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetadata {
    pub version: u32,
    pub step_id: String,
    pub step_name: String,
    pub script_path: String,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub settings: BTreeMap<String, String>,
    pub output: ArchivedOutput,
}

impl CacheMetadata {
    pub fn for_step(step: &Step, duration: Duration, output: ArchivedOutput) -> Self {
        Self {
            version: METADATA_VERSION,
            step_id: step.id().to_string(),
            step_name: step.name().to_string(),
            script_path: step.script().path().display().to_string(),
            created_at: Utc::now(),
            duration_ms: duration.as_millis() as u64,
            settings: step
                .settings()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            output,
        }
    }
}

/// A stored result, ready to restore
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub metadata: CacheMetadata,
    pub archive_path: PathBuf,
}

/// Cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
    pub total_files: usize,
}

/// Local directory cache of host-mode step results
#[derive(Debug, Clone)]
pub struct StepCache {
    root: PathBuf,
}

impl StepCache {
    /// The directory is created lazily on the first store
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, id: &StepId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Look up a stored result.
    ///
    /// Damaged entries are removed and reported as [`CacheError::Corrupted`].
    pub fn lookup(&self, id: &StepId) -> Result<Option<CacheEntry>, CacheError> {
        let entry_dir = self.entry_dir(id);

        match fs::metadata(&entry_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(self.discard(id, "entry is not a directory")),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CacheError::Unreachable {
                    path: entry_dir,
                    source,
                })
            }
        }

        let metadata_path = entry_dir.join(METADATA_FILE);
        let archive_path = entry_dir.join(ARCHIVE_FILE);

        if !metadata_path.exists() || !archive_path.exists() {
            return Err(self.discard(id, "missing metadata or archive"));
        }

        let metadata: CacheMetadata = match fs::read_to_string(&metadata_path)
            .map_err(|e| e.to_string())
            .and_then(|json| serde_json::from_str(&json).map_err(|e| e.to_string()))
        {
            Ok(metadata) => metadata,
            Err(reason) => return Err(self.discard(id, &format!("unreadable metadata: {reason}"))),
        };

        if metadata.step_id != id.as_str() {
            return Err(self.discard(id, "metadata belongs to another step"));
        }

        Ok(Some(CacheEntry {
            metadata,
            archive_path,
        }))
    }

    /// Extract a stored result into `dest`, replacing its contents
    pub fn restore(&self, entry: &CacheEntry, dest: &Path) -> Result<(), CacheError> {
        let id = entry.metadata.step_id.clone();
        let corrupted = |reason: String| CacheError::Corrupted {
            id: id.clone(),
            reason,
        };

        reset_dir(dest).map_err(|e| corrupted(format!("cannot prepare {}: {e}", dest.display())))?;

        let verified = archive::extract_archive(&entry.archive_path, dest)
            .and_then(|_| archive::hash_dir(dest))
            .map_err(|e| e.to_string())
            .and_then(|hash| {
                if hash == entry.metadata.output.content_hash {
                    Ok(())
                } else {
                    Err("content hash mismatch".to_string())
                }
            });

        if let Err(reason) = verified {
            let _ = fs::remove_dir_all(dest);
            if let Some(step_id) = StepId::parse(&id) {
                let _ = fs::remove_dir_all(self.entry_dir(&step_id));
            }
            return Err(corrupted(reason));
        }

        Ok(())
    }

    /// Store a successful step's output directory under its id
    pub fn store(
        &self,
        step: &Step,
        output_dir: &Path,
        duration: Duration,
    ) -> Result<CacheMetadata, CacheError> {
        let id = step.id();
        let write_err = |message: String| CacheError::Write {
            id: id.to_string(),
            message,
        };

        fs::create_dir_all(&self.root).map_err(|source| CacheError::Unreachable {
            path: self.root.clone(),
            source,
        })?;

        let staging = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempdir_in(&self.root)
            .map_err(|e| write_err(e.to_string()))?;

        let output = archive::archive_dir(output_dir, &staging.path().join(ARCHIVE_FILE))
            .map_err(|e| write_err(format!("{e:#}")))?;

        let metadata = CacheMetadata::for_step(step, duration, output);
        let json = serde_json::to_string_pretty(&metadata).map_err(|e| write_err(e.to_string()))?;
        fs::write(staging.path().join(METADATA_FILE), json).map_err(|e| write_err(e.to_string()))?;

        let entry_dir = self.entry_dir(id);
        if entry_dir.exists() {
            fs::remove_dir_all(&entry_dir).map_err(|e| write_err(e.to_string()))?;
        }

        if let Err(e) = fs::rename(staging.path(), &entry_dir) {
            // Another writer landed the same id first
            if !entry_dir.join(METADATA_FILE).exists() {
                return Err(write_err(e.to_string()));
            }
            debug!(step_id = %id.short(), "cache entry written concurrently");
        }

        Ok(metadata)
    }

    /// Remove one entry
    pub fn remove(&self, id: &StepId) -> Result<bool, CacheError> {
        let entry_dir = self.entry_dir(id);
        if !entry_dir.exists() {
            return Ok(false);
        }

        fs::remove_dir_all(&entry_dir).map_err(|e| CacheError::Write {
            id: id.to_string(),
            message: e.to_string(),
        })?;
        Ok(true)
    }

    /// Ids of all entries, sorted
    pub fn list(&self) -> Result<Vec<StepId>, CacheError> {
        let mut ids = Vec::new();

        if !self.root.exists() {
            return Ok(ids);
        }

        let entries = fs::read_dir(&self.root).map_err(|source| CacheError::Unreachable {
            path: self.root.clone(),
            source,
        })?;

        for entry in entries.flatten() {
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            if let Some(id) = entry.file_name().to_str().and_then(StepId::parse) {
                ids.push(id);
            }
        }

        ids.sort();
        Ok(ids)
    }

    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        let mut stats = CacheStats::default();

        for id in self.list()? {
            let metadata_path = self.entry_dir(&id).join(METADATA_FILE);
            if let Ok(json) = fs::read_to_string(&metadata_path) {
                if let Ok(metadata) = serde_json::from_str::<CacheMetadata>(&json) {
                    stats.total_entries += 1;
                    stats.total_size_bytes += metadata.output.size_bytes;
                    stats.total_files += metadata.output.file_count;
                }
            }
        }

        Ok(stats)
    }

    /// Remove every entry
    pub fn clean_all(&self) -> Result<usize, CacheError> {
        let ids = self.list()?;
        for id in &ids {
            self.remove(id)?;
        }
        Ok(ids.len())
    }

    fn discard(&self, id: &StepId, reason: &str) -> CacheError {
        let _ = fs::remove_dir_all(self.entry_dir(id));
        CacheError::Corrupted {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}
