//! Installs cached binaries into a target directory and removes them again.
//!
//! Installed files are hardlinks to the store, so installing into many
//! workspaces costs no extra disk space. When the store and the target live
//! on different volumes the file is copied instead.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::ContentCache;
use super::error::{BinaryError, Result};
use super::extractor::make_executable;
use super::store::CacheEntry;
use super::types::PlatformDescriptor;

/// How a file ended up in the target directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    HardLink,
    /// Store and target are on different volumes.
    Copy,
}

// ============================================================================
// Installer
// ============================================================================

/// Links the files of a cache entry into target directories.
#[derive(Debug, Clone)]
pub struct Installer {
    cache: Arc<ContentCache>,
    require_existing_target: bool,
}

impl Installer {
    pub fn new(cache: Arc<ContentCache>, require_existing_target: bool) -> Self {
        Self {
            cache,
            require_existing_target,
        }
    }

    /// Makes every file of `descriptor` available in `target_dir`.
    ///
    /// Fetches on a cache miss. Re-running replaces previously installed
    /// files. Returns the installed paths in declaration order.
    pub async fn install(
        &self,
        descriptor: &PlatformDescriptor,
        target_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        self.prepare_target(target_dir)?;

        let entry = self.cache.get_or_fetch(descriptor).await?;
        let installed = link_entry(&entry, target_dir)?;

        info!(
            "Installed {} file(s) into {}",
            installed.len(),
            target_dir.display()
        );
        Ok(installed)
    }

    fn prepare_target(&self, target_dir: &Path) -> Result<()> {
        if target_dir.is_dir() {
            return Ok(());
        }

        if self.require_existing_target {
            return Err(BinaryError::TargetNotPrepared {
                path: target_dir.to_path_buf(),
            });
        }

        debug!("Creating target directory {}", target_dir.display());
        fs::create_dir_all(target_dir).map_err(|e| BinaryError::io(target_dir, e))
    }
}

/// Links every file of `entry` into `target_dir`.
pub fn link_entry(entry: &CacheEntry, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut installed = Vec::with_capacity(entry.files.len());

    for file in &entry.files {
        let dest = target_dir.join(&file.name);
        install_file(&file.path, &dest, |src, dest| fs::hard_link(src, dest))?;
        installed.push(dest);
    }

    Ok(installed)
}

/// Places one cached file at `dest` through `link` and marks it executable.
fn install_file<L>(src: &Path, dest: &Path, link: L) -> Result<LinkKind>
where
    L: Fn(&Path, &Path) -> io::Result<()>,
{
    let kind = link_or_copy_with(src, dest, link)?;

    if cfg!(not(windows)) {
        make_executable(dest)?;
    }

    Ok(kind)
}

/// Hardlinks `src` to `dest`, replacing whatever is at `dest`.
///
/// Copies instead when the two paths are on different volumes.
pub fn link_or_copy(src: &Path, dest: &Path) -> Result<LinkKind> {
    link_or_copy_with(src, dest, |src, dest| fs::hard_link(src, dest))
}

fn link_or_copy_with<L>(src: &Path, dest: &Path, link: L) -> Result<LinkKind>
where
    L: Fn(&Path, &Path) -> io::Result<()>,
{
    remove_if_exists(dest)?;

    match link(src, dest) {
        Ok(()) => Ok(LinkKind::HardLink),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            // Something recreated dest since we removed it
            remove_if_exists(dest)?;
            link(src, dest).map_err(|e| BinaryError::io(dest, e))?;
            Ok(LinkKind::HardLink)
        }
        Err(e) if is_cross_device(&e) => {
            warn!(
                "Cannot hardlink {} to {} across volumes, copying instead",
                src.display(),
                dest.display()
            );
            fs::copy(src, dest).map_err(|e| BinaryError::io(dest, e))?;
            Ok(LinkKind::Copy)
        }
        Err(e) => Err(BinaryError::io(dest, e)),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed existing {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BinaryError::io(path, e)),
    }
}

#[cfg(unix)]
fn is_cross_device(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EXDEV)
}

#[cfg(windows)]
fn is_cross_device(e: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    e.raw_os_error() == Some(17)
}

#[cfg(not(any(unix, windows)))]
fn is_cross_device(_e: &io::Error) -> bool {
    false
}

// ============================================================================
// Uninstaller
// ============================================================================

/// Removes the files `descriptor` installs from `target_dir`.
///
/// Only declared output names are touched; the store is never modified.
/// A missing directory or missing files are not an error. Returns the paths
/// that were actually removed.
pub fn uninstall(descriptor: &PlatformDescriptor, target_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();

    if !target_dir.is_dir() {
        debug!("{} does not exist, nothing to uninstall", target_dir.display());
        return Ok(removed);
    }

    for name in descriptor.output_names() {
        let path = target_dir.join(name);
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BinaryError::io(&path, e)),
        }
    }

    info!(
        "Removed {} file(s) from {}",
        removed.len(),
        target_dir.display()
    );
    Ok(removed)
}
