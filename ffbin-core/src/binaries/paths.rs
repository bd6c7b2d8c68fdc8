//! Path resolution for the binary cache and settings.
//!
//! The cache lives in the per-user cache directory so that it survives
//! reboots and is shared by every workspace of the same user:
//!
//! - Linux: `~/.cache/ffbin/binaries/`
//! - macOS: `~/Library/Caches/ffbin/binaries/`
//! - Windows: `C:\Users\<User>\AppData\Local\ffbin\binaries\`
//!
//! When the OS reports no cache directory the OS temp folder is used instead.

use std::path::{Path, PathBuf};

/// Application directory name under the OS cache/config folders.
const APP_DIR: &str = "ffbin";

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "FFBIN_CACHE_DIR";

/// Subdirectory of the cache root holding scratch and staging directories.
pub const SCRATCH_DIR: &str = ".tmp";

// ============================================================================
// Path Resolution
// ============================================================================

/// Returns the default cache root.
///
/// Path: `{cache}/ffbin/binaries/`
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("binaries")
}

/// Returns the path to the settings file.
///
/// Path: `{config}/ffbin/settings.json`
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("settings.json")
}

/// Returns the scratch directory inside a cache root.
///
/// Path: `{cache_root}/.tmp/`
pub fn scratch_dir(cache_root: &Path) -> PathBuf {
    cache_root.join(SCRATCH_DIR)
}
