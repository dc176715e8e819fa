//! Dataset packer.
//!
//! Bundles a local training-input directory into one gzip-compressed tar
//! archive plus a JSON manifest of every file with its size and SHA-256. The
//! manifest doubles as the remote completeness check: the executor uploads it
//! as a `sha256sum -c` list next to the archive.
//!
//! Everything here is blocking filesystem work; async callers go through
//! `tokio::task::spawn_blocking`.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("Dataset directory not found: {0}")]
    NotFound(PathBuf),

    #[error("Dataset directory is empty: {0}")]
    Empty(PathBuf),

    #[error("Symlinks are not allowed in datasets: {0}")]
    Symlink(PathBuf),

    #[error("Unsupported file type in dataset: {0}")]
    SpecialFile(PathBuf),

    #[error("Path is not valid UTF-8: {0}")]
    InvalidPath(PathBuf),

    #[error("Archive does not match manifest: {0}")]
    Mismatch(String),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),
}

/// One file in a packed dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the dataset root, `/`-separated.
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Contents of a packed dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    /// Name of the source directory.
    pub root_name: String,
    pub file_count: u64,
    pub total_bytes: u64,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Checksum list in `sha256sum` format.
    #[must_use]
    pub fn to_checksum_list(&self) -> String {
        self.files
            .iter()
            .map(|f| format!("{}  {}\n", f.sha256, f.path))
            .collect()
    }

    /// Read a manifest written by [`DatasetPacker::pack`].
    ///
    /// # Errors
    /// Returns an error if the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self, PackError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// Shape of a dataset directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSummary {
    pub file_count: u64,
    pub total_bytes: u64,
}

/// Output of [`DatasetPacker::pack`].
#[derive(Debug, Clone)]
pub struct PackedDataset {
    pub archive_path: PathBuf,
    pub manifest_path: PathBuf,
    pub manifest: Manifest,
}

#[derive(Debug, Clone)]
pub struct DatasetPacker {
    compression: Compression,
}

impl Default for DatasetPacker {
    fn default() -> Self {
        Self {
            compression: Compression::default(),
        }
    }
}

impl DatasetPacker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Compression level 0-9.
    #[must_use]
    pub fn with_level(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    /// Check that `source_dir` is a packable dataset.
    ///
    /// # Errors
    /// Returns an error if the directory is missing or empty, or contains
    /// symlinks or special files.
    pub fn validate(&self, source_dir: &Path) -> Result<DatasetSummary, PackError> {
        let files = collect_files(source_dir)?;
        let total_bytes = files.iter().map(|(_, _, size)| size).sum();
        Ok(DatasetSummary {
            file_count: files.len() as u64,
            total_bytes,
        })
    }

    /// Pack `source_dir` into `out_dir`, returning the archive and manifest
    /// paths.
    ///
    /// # Errors
    /// Returns an error if validation fails or any file cannot be read or
    /// written.
    pub fn pack(&self, source_dir: &Path, out_dir: &Path) -> Result<PackedDataset, PackError> {
        let files = collect_files(source_dir)?;
        let root_name = source_dir
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty())
            .unwrap_or("dataset")
            .to_string();

        std::fs::create_dir_all(out_dir)?;
        let archive_path = out_dir.join(format!("{root_name}.tar.gz"));
        let manifest_path = out_dir.join(format!("{root_name}.manifest.json"));

        let encoder = GzEncoder::new(BufWriter::new(File::create(&archive_path)?), self.compression);
        let mut builder = tar::Builder::new(encoder);
        let mut entries = Vec::with_capacity(files.len());

        for (absolute, relative, size) in &files {
            let sha256 = sha256_file(absolute)?;
            builder.append_path_with_name(absolute, relative)?;
            debug!(path = %relative, size, "Packed file");
            entries.push(ManifestEntry {
                path: relative.clone(),
                size: *size,
                sha256,
            });
        }
        builder.into_inner()?.finish()?;

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            created_at: Utc::now(),
            root_name,
            file_count: entries.len() as u64,
            total_bytes: entries.iter().map(|e| e.size).sum(),
            files: entries,
        };
        std::fs::write(&manifest_path, serde_json::to_vec_pretty(&manifest)?)?;

        info!(
            archive = %archive_path.display(),
            files = manifest.file_count,
            bytes = manifest.total_bytes,
            "Dataset packed"
        );
        Ok(PackedDataset {
            archive_path,
            manifest_path,
            manifest,
        })
    }

    /// Re-read `archive` and check every file against `manifest`.
    ///
    /// # Errors
    /// Returns [`PackError::Mismatch`] for missing, extra, or altered files.
    pub fn verify(&self, archive: &Path, manifest: &Manifest) -> Result<(), PackError> {
        let mut expected: HashMap<&str, &ManifestEntry> =
            manifest.files.iter().map(|e| (e.path.as_str(), e)).collect();

        let decoder = GzDecoder::new(BufReader::new(File::open(archive)?));
        let mut tar = tar::Archive::new(decoder);
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let path = entry.path()?.into_owned();
            let name = path
                .to_str()
                .ok_or_else(|| PackError::InvalidPath(path.clone()))?
                .to_string();
            let Some(want) = expected.remove(name.as_str()) else {
                return Err(PackError::Mismatch(format!("unexpected file `{name}`")));
            };

            let mut hasher = Sha256::new();
            let size = io::copy(&mut entry, &mut hasher)?;
            let digest = hex::encode(hasher.finalize());
            if size != want.size || digest != want.sha256 {
                return Err(PackError::Mismatch(format!("`{name}` differs from manifest")));
            }
        }

        if let Some(missing) = expected.keys().next() {
            return Err(PackError::Mismatch(format!(
                "`{missing}` missing from archive ({} file(s) in total)",
                expected.len()
            )));
        }
        Ok(())
    }
}

/// Regular files under `root` as (absolute, relative, size), sorted by path.
fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String, u64)>, PackError> {
    if !root.is_dir() {
        return Err(PackError::NotFound(root.to_path_buf()));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            return Err(PackError::Symlink(entry.path().to_path_buf()));
        }
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            return Err(PackError::SpecialFile(entry.path().to_path_buf()));
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|_| PackError::InvalidPath(entry.path().to_path_buf()))?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        let relative = parts
            .ok_or_else(|| PackError::InvalidPath(entry.path().to_path_buf()))?
            .join("/");
        let size = entry.metadata()?.len();
        files.push((entry.into_path(), relative, size));
    }

    if files.is_empty() {
        return Err(PackError::Empty(root.to_path_buf()));
    }
    Ok(files)
}

fn sha256_file(path: &Path) -> Result<String, PackError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
