//! Binary manager for coordinating the cache and installations.
//!
//! The `BinaryManager` is the main entry point for hosts. It wires the
//! settings, the platform descriptor, the content cache and the installer
//! together and exposes the host hooks that run after a workspace is
//! installed or before it is removed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::cache::ContentCache;
use super::catalog;
use super::downloader::{Fetch, HttpFetcher};
use super::error::{BinaryError, Result};
use super::extractor::{ArchiveExtractor, Extract};
use super::installer::{self, Installer};
use super::store::CacheStore;
use super::types::{CacheKey, PlatformDescriptor};
use crate::config::Settings;

// ============================================================================
// Status
// ============================================================================

/// State of the cache entry for the active descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    /// Published and complete.
    Ready,
    /// Never fetched.
    Missing,
    /// Present on disk but unusable.
    Corrupt(String),
}

/// Presence of one output file in a target directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledFile {
    pub name: String,
    pub path: PathBuf,
    pub installed: bool,
}

/// Combined cache and installation state for a target directory.
#[derive(Debug, Clone)]
pub struct BinaryStatus {
    pub key: CacheKey,
    pub entry: EntryState,
    pub files: Vec<InstalledFile>,
}

impl BinaryStatus {
    /// Returns true when every output file is present.
    pub fn is_installed(&self) -> bool {
        self.files.iter().all(|f| f.installed)
    }
}

// ============================================================================
// Binary Manager
// ============================================================================

/// Manages the cached binaries and their installation into target directories.
///
/// Thread-safe; share it behind an `Arc` across async tasks.
#[derive(Debug)]
pub struct BinaryManager {
    settings: Settings,
    descriptor: PlatformDescriptor,
    cache: Arc<ContentCache>,
}

impl BinaryManager {
    /// Creates a manager for the running platform that downloads over HTTP.
    pub fn new(settings: Settings) -> Result<Self> {
        let descriptor = catalog::resolve()?;
        let fetcher = HttpFetcher::new(&settings)?;
        Ok(Self::with_parts(
            settings,
            descriptor,
            Arc::new(fetcher),
            Arc::new(ArchiveExtractor),
        ))
    }

    /// Creates a manager from explicit parts.
    pub fn with_parts(
        settings: Settings,
        descriptor: PlatformDescriptor,
        fetcher: Arc<dyn Fetch>,
        extractor: Arc<dyn Extract>,
    ) -> Self {
        let store = CacheStore::new(settings.cache_root());
        let cache = ContentCache::new(store, fetcher, extractor, settings.missing_file_policy);

        info!(
            "BinaryManager initialized. Cache root: {}, sources: {}",
            settings.cache_root().display(),
            descriptor.sources.len()
        );

        Self {
            settings,
            descriptor,
            cache: Arc::new(cache),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn descriptor(&self) -> &PlatformDescriptor {
        &self.descriptor
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn cache_root(&self) -> &Path {
        self.cache.store().root()
    }

    // ========================================================================
    // Install / Uninstall
    // ========================================================================

    /// Installs the binaries into `bin_path`.
    ///
    /// Whether `bin_path` may be created is decided by
    /// `Settings::require_existing_target`.
    pub async fn install(&self, bin_path: &Path) -> Result<Vec<PathBuf>> {
        Installer::new(
            Arc::clone(&self.cache),
            self.settings.require_existing_target,
        )
        .install(&self.descriptor, bin_path)
        .await
    }

    /// Removes the installed binaries from `bin_path`. The cache is kept.
    pub fn uninstall(&self, bin_path: &Path) -> Result<Vec<PathBuf>> {
        installer::uninstall(&self.descriptor, bin_path)
    }

    /// Hook run by the host after it created a workspace.
    ///
    /// The host owns `bin_path`; it is never created here.
    pub async fn on_installed(&self, bin_path: &Path) -> Result<Vec<PathBuf>> {
        Installer::new(Arc::clone(&self.cache), true)
            .install(&self.descriptor, bin_path)
            .await
    }

    /// Hook run by the host before it deletes a workspace.
    pub fn after_uninstalling(&self, bin_path: &Path) -> Result<Vec<PathBuf>> {
        self.uninstall(bin_path)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Returns the path of an installed tool, e.g. `ffmpeg` or `ffprobe`.
    ///
    /// The `.exe` suffix is added on Windows.
    pub fn tool_path(&self, bin_path: &Path, name: &str) -> Result<PathBuf> {
        let path = bin_path.join(catalog::tool_file_name(name));
        if path.is_file() {
            Ok(path)
        } else {
            Err(BinaryError::ToolNotFound {
                name: name.to_string(),
                path,
            })
        }
    }

    /// Reports the cache entry state and which outputs exist in `bin_path`.
    pub fn status(&self, bin_path: &Path) -> Result<BinaryStatus> {
        let key = CacheKey::compute(&self.descriptor)?;

        let entry = match self.cache.lookup(&self.descriptor) {
            Ok(Some(_)) => EntryState::Ready,
            Ok(None) => EntryState::Missing,
            Err(BinaryError::CorruptCacheEntry { reason, .. }) => {
                warn!("Cache entry {} is corrupt: {}", key, reason);
                EntryState::Corrupt(reason)
            }
            Err(e) => return Err(e),
        };

        let files = self
            .descriptor
            .output_names()
            .map(|name| {
                let path = bin_path.join(name);
                InstalledFile {
                    name: name.to_string(),
                    installed: path.is_file(),
                    path,
                }
            })
            .collect();

        Ok(BinaryStatus { key, entry, files })
    }
}
