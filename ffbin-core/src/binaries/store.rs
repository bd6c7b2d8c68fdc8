//! On-disk content-addressed store.
//!
//! Every entry lives in its own directory named after its cache key:
//!
//! ```text
//! <root>/
//!   .tmp/                 scratch and staging directories
//!   <key>/
//!     entry.json          EntryManifest
//!     files/<name>        cached binaries
//! ```
//!
//! Entries are assembled in a staging directory under `.tmp` and published
//! with a single `rename`, so a published directory is always complete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use super::error::{BinaryError, Result};
use super::paths;
use super::types::CacheKey;

/// File name of the manifest inside an entry directory.
pub const ENTRY_MANIFEST: &str = "entry.json";

/// Subdirectory of an entry holding the cached files.
pub const FILES_DIR: &str = "files";

/// Current schema version for entry manifests.
const SCHEMA_VERSION: u32 = 1;

/// Scratch directories older than this were left behind by a killed process.
pub const STALE_SCRATCH_AGE: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Entry Data Structures
// ============================================================================

/// Metadata written next to the files of a published entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryManifest {
    /// Schema version for forward compatibility.
    pub schema_version: u32,
    pub key: CacheKey,
    /// When the entry was published.
    pub created_at: DateTime<Utc>,
    /// URLs the files were fetched from.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Names of the cached files, in declaration order.
    pub files: Vec<String>,
}

/// A file stored in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedFile {
    /// Absolute path inside the store.
    pub path: PathBuf,
    pub name: String,
}

/// A published cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub dir: PathBuf,
    pub files: Vec<CachedFile>,
}

impl CacheEntry {
    /// Looks up a cached file by name.
    pub fn file(&self, name: &str) -> Option<&CachedFile> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Total size of the cached files in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.files
            .iter()
            .filter_map(|f| fs::metadata(&f.path).ok())
            .map(|m| m.len())
            .sum()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Content-addressed storage rooted at a directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    root: PathBuf,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory a key is published under.
    pub fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    /// Creates a fresh scratch directory inside the store.
    ///
    /// Removed when the returned guard is dropped.
    pub fn scratch(&self, prefix: &str) -> Result<TempDir> {
        let scratch = paths::scratch_dir(&self.root);
        fs::create_dir_all(&scratch).map_err(|e| BinaryError::io(&scratch, e))?;

        tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&scratch)
            .map_err(|e| BinaryError::io(&scratch, e))
    }

    /// Removes scratch and staging directories last modified `max_age` ago or earlier.
    ///
    /// Returns the number of directories removed.
    pub fn sweep_scratch(&self, max_age: Duration) -> Result<usize> {
        let scratch = paths::scratch_dir(&self.root);
        let read_dir = match fs::read_dir(&scratch) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BinaryError::io(&scratch, e)),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in read_dir {
            let entry = entry.map_err(|e| BinaryError::io(&scratch, e))?;
            let path = entry.path();

            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .map(|modified| now.duration_since(modified).unwrap_or_default());
            match age {
                Ok(age) if age >= max_age => {}
                _ => continue,
            }

            let result = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match result {
                Ok(()) => {
                    debug!("Removed stale scratch {}", path.display());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove stale scratch {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!("Swept {} stale scratch entries from {}", removed, scratch.display());
        }
        Ok(removed)
    }

    /// Reads a published entry.
    ///
    /// Returns `Ok(None)` when the key was never published, and
    /// `CorruptCacheEntry` when the entry directory is incomplete.
    pub fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        if !dir.is_dir() {
            debug!("No cache entry for {}", key);
            return Ok(None);
        }

        read_entry(&dir, key).map(Some)
    }

    /// Starts assembling a new entry for `key`.
    pub fn stage(&self, key: &CacheKey) -> Result<StagedEntry> {
        self.sweep_scratch(STALE_SCRATCH_AGE)?;

        let temp = self.scratch("stage-")?;
        let files_dir = temp.path().join(FILES_DIR);
        fs::create_dir_all(&files_dir).map_err(|e| BinaryError::io(&files_dir, e))?;

        Ok(StagedEntry {
            key: key.clone(),
            target: self.entry_dir(key),
            temp,
            names: Vec::new(),
        })
    }

    /// Lists the keys of all published entries, sorted.
    pub fn entries(&self) -> Result<Vec<CacheKey>> {
        let read_dir = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BinaryError::io(&self.root, e)),
        };

        let mut keys = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|e| BinaryError::io(&self.root, e))?;
            let Some(key) = entry.file_name().to_str().and_then(CacheKey::parse) else {
                continue;
            };
            if entry.path().join(ENTRY_MANIFEST).is_file() {
                keys.push(key);
            }
        }

        keys.sort();
        Ok(keys)
    }
}

fn corrupt(dir: &Path, reason: impl Into<String>) -> BinaryError {
    BinaryError::CorruptCacheEntry {
        path: dir.to_path_buf(),
        reason: reason.into(),
    }
}

fn read_entry(dir: &Path, key: &CacheKey) -> Result<CacheEntry> {
    let manifest_path = dir.join(ENTRY_MANIFEST);
    let content = fs::read_to_string(&manifest_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => corrupt(dir, format!("{} is missing", ENTRY_MANIFEST)),
        _ => BinaryError::io(&manifest_path, e),
    })?;

    let manifest: EntryManifest = serde_json::from_str(&content)
        .map_err(|e| corrupt(dir, format!("unreadable {}: {}", ENTRY_MANIFEST, e)))?;

    if manifest.schema_version != SCHEMA_VERSION {
        warn!(
            "Entry {} has schema version {}, expected {}",
            key, manifest.schema_version, SCHEMA_VERSION
        );
    }

    if &manifest.key != key {
        return Err(corrupt(
            dir,
            format!("manifest is for key {}", manifest.key),
        ));
    }

    let files_dir = dir.join(FILES_DIR);
    let mut files = Vec::with_capacity(manifest.files.len());
    for name in manifest.files {
        let path = files_dir.join(&name);
        if !path.is_file() {
            return Err(corrupt(dir, format!("cached file '{}' is missing", name)));
        }
        files.push(CachedFile { path, name });
    }

    Ok(CacheEntry {
        key: key.clone(),
        dir: dir.to_path_buf(),
        files,
    })
}

// ============================================================================
// Staging
// ============================================================================

/// An entry being assembled. Dropping it without publishing discards it.
#[derive(Debug)]
pub struct StagedEntry {
    key: CacheKey,
    target: PathBuf,
    temp: TempDir,
    names: Vec<String>,
}

impl StagedEntry {
    /// Names of the files staged so far.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Moves `source` into the entry under `name`.
    ///
    /// Falls back to copying when the source is on another volume.
    pub fn put(&mut self, source: &Path, name: &str) -> Result<CachedFile> {
        let dest = self.temp.path().join(FILES_DIR).join(name);

        if fs::rename(source, &dest).is_err() {
            debug!(
                "Rename failed, copying {} to {}",
                source.display(),
                dest.display()
            );
            fs::copy(source, &dest).map_err(|e| BinaryError::io(source, e))?;
        }

        if !self.names.iter().any(|n| n == name) {
            self.names.push(name.to_string());
        }

        Ok(CachedFile {
            path: dest,
            name: name.to_string(),
        })
    }

    /// Writes the manifest and renames the entry into place.
    ///
    /// If another publisher got there first, their entry is returned instead
    /// and this one is discarded.
    pub fn publish(self, sources: &[String]) -> Result<CacheEntry> {
        let manifest = EntryManifest {
            schema_version: SCHEMA_VERSION,
            key: self.key.clone(),
            created_at: Utc::now(),
            sources: sources.to_vec(),
            files: self.names.clone(),
        };

        let manifest_path = self.temp.path().join(ENTRY_MANIFEST);
        let json = serde_json::to_string_pretty(&manifest).map_err(|e| {
            BinaryError::io(&manifest_path, io::Error::new(io::ErrorKind::Other, e))
        })?;
        fs::write(&manifest_path, json).map_err(|e| BinaryError::io(&manifest_path, e))?;

        match fs::rename(self.temp.path(), &self.target) {
            Ok(()) => {
                info!(
                    "Published cache entry {} ({} files)",
                    self.key,
                    manifest.files.len()
                );
            }
            Err(e) if self.target.is_dir() => {
                debug!("Lost publish race for {}: {}", self.key, e);
                info!("Cache entry {} already published, adopting it", self.key);
            }
            Err(e) => return Err(BinaryError::io(&self.target, e)),
        }

        // The staging directory is gone after a successful rename; the guard
        // only cleans up after a lost race.
        read_entry(&self.target, &self.key)
    }
}
