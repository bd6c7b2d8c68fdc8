//! Settings for the binary cache.
//!
//! Settings are persisted as JSON next to the other per-user configuration.
//! A missing or unreadable file falls back to defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::binaries::error::{BinaryError, Result};
use crate::binaries::paths;

// =============================================================================
// Missing File Policy
// =============================================================================

/// What to do when a declared file is not found in an extracted archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MissingFilePolicy {
    /// Abort the fetch with `MissingExpectedFile`.
    #[default]
    Fail,
    /// Log a warning and cache whatever was found.
    Warn,
}

impl std::fmt::Display for MissingFilePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fail => write!(f, "fail"),
            Self::Warn => write!(f, "warn"),
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Default timeout for a single archive download.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;

/// Hosts the catalog downloads from.
pub const DEFAULT_ALLOWED_DOMAINS: &[&str] = &["github.com", "evermeet.cx"];

/// Binary cache settings - persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Cache root. `None` uses the per-user cache directory.
    pub cache_dir: Option<PathBuf>,

    /// Refuse to install into a directory the host has not created.
    pub require_existing_target: bool,

    /// Behaviour for declared files missing from an archive.
    pub missing_file_policy: MissingFilePolicy,

    /// Transport timeout per download, in seconds.
    pub download_timeout_secs: u64,

    /// Hosts downloads may come from (subdomains included).
    /// Empty allows any host.
    pub allowed_domains: Vec<String>,

    /// Allow plain `http://` URLs.
    pub allow_insecure_http: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: None,
            require_existing_target: true,
            missing_file_policy: MissingFilePolicy::default(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            allowed_domains: DEFAULT_ALLOWED_DOMAINS
                .iter()
                .map(|d| d.to_string())
                .collect(),
            allow_insecure_http: false,
        }
    }
}

impl Settings {
    /// Loads settings from the default location and applies environment overrides.
    pub fn load() -> Self {
        let mut settings = Self::load_from(&paths::default_settings_path());
        settings.apply_overrides(|key| std::env::var(key).ok());
        settings
    }

    /// Loads settings from a specific file, using defaults if it is missing or invalid.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                return Self::default();
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read settings, using defaults");
                return Self::default();
            }
        };

        match serde_json::from_str::<Settings>(&content) {
            Ok(mut settings) => {
                settings.validate();
                settings
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to parse settings, using defaults");
                Self::default()
            }
        }
    }

    /// Saves settings to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| BinaryError::io(parent, e))?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BinaryError::Config(format!("failed to serialize settings: {}", e)))?;
        fs::write(path, json).map_err(|e| BinaryError::io(path, e))?;
        Ok(())
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup(paths::CACHE_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
    }

    /// Clamps values to usable ranges.
    pub fn validate(&mut self) {
        self.download_timeout_secs = self.download_timeout_secs.clamp(1, 3600);
        self.allowed_domains.retain(|d| !d.trim().is_empty());
    }

    /// Returns the effective cache root.
    pub fn cache_root(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(paths::default_cache_dir)
    }

    /// Returns the download timeout.
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

// =============================================================================
// Tests
// =============================================================================
