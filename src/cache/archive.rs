/// Output directory archiving and restoration
///
/// A step's output directory is stored as a single tar+zstd archive.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tar::{Archive, Builder};
use walkdir::WalkDir;
use zstd::{decode_all, encode_all};

const ZSTD_LEVEL: i32 = 3;

/// Summary of an archived output directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedOutput {
    pub content_hash: String,
    pub size_bytes: u64,
    pub file_count: usize,
}

/// Archive the contents of `output_dir` into `archive_path`
pub fn archive_dir(output_dir: &Path, archive_path: &Path) -> Result<ArchivedOutput> {
    let mut tar_data = Vec::new();
    {
        let mut tar = Builder::new(&mut tar_data);
        tar.follow_symlinks(false);
        tar.append_dir_all(".", output_dir)
            .with_context(|| format!("Failed to archive directory: {}", output_dir.display()))?;
        tar.finish().context("Failed to finalize tar archive")?;
    }

    let compressed =
        encode_all(tar_data.as_slice(), ZSTD_LEVEL).context("Failed to compress archive with zstd")?;

    let mut file = File::create(archive_path)
        .with_context(|| format!("Failed to create archive: {}", archive_path.display()))?;
    file.write_all(&compressed)
        .context("Failed to write compressed archive")?;

    let (size_bytes, file_count) = dir_size_and_count(output_dir)?;

    Ok(ArchivedOutput {
        content_hash: hash_dir(output_dir)?,
        size_bytes,
        file_count,
    })
}

/// Extract an archive into `dest` (which must exist)
pub fn extract_archive(archive_path: &Path, dest: &Path) -> Result<()> {
    let compressed = fs::read(archive_path)
        .with_context(|| format!("Failed to read archive: {}", archive_path.display()))?;

    let tar_data =
        decode_all(compressed.as_slice()).context("Failed to decompress archive with zstd")?;

    Archive::new(tar_data.as_slice())
        .unpack(dest)
        .with_context(|| format!("Failed to extract archive to: {}", dest.display()))?;

    Ok(())
}

/// Deterministic hash of a directory's relative paths and file contents
pub fn hash_dir(path: &Path) -> Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(path).unwrap_or(entry.path());
        if rel.as_os_str().is_empty() {
            continue;
        }

        let rel = rel.to_string_lossy();
        let file_type = entry.file_type();
        if file_type.is_file() {
            hasher.update(b"F");
            hasher.update(rel.as_bytes());
            hasher.update([0]);
            hasher.update(fs::read(entry.path())?);
        } else if file_type.is_dir() {
            hasher.update(b"D");
            hasher.update(rel.as_bytes());
        } else if file_type.is_symlink() {
            hasher.update(b"L");
            hasher.update(rel.as_bytes());
            hasher.update([0]);
            hasher.update(fs::read_link(entry.path())?.to_string_lossy().as_bytes());
        }
        hasher.update([0]);
    }

    Ok(hex::encode(hasher.finalize()))
}

fn dir_size_and_count(path: &Path) -> Result<(u64, usize)> {
    let mut total_size = 0;
    let mut file_count = 0;

    for entry in WalkDir::new(path) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total_size += entry.metadata()?.len();
            file_count += 1;
        }
    }

    Ok((total_size, file_count))
}
