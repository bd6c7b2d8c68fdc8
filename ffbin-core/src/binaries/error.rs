//! Error types for binary fetching, caching and installation.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used across the binaries module.
pub type Result<T> = std::result::Result<T, BinaryError>;

/// Errors that can occur while resolving, fetching, caching or installing binaries.
#[derive(Debug, Error)]
pub enum BinaryError {
    /// The running OS has no descriptor.
    #[error("Unsupported platform: {os}")]
    UnsupportedPlatform { os: String },

    /// The transfer failed or produced an empty file. Callers may retry.
    #[error("Download failed for {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("Unsupported archive format: {}", path.display())]
    UnsupportedArchive { path: PathBuf },

    #[error("Failed to extract {}: {reason}", path.display())]
    Extraction { path: PathBuf, reason: String },

    /// A declared file never showed up in the extracted archive.
    #[error("Archive from {url} does not contain expected file '{archive_path}'")]
    MissingExpectedFile { url: String, archive_path: String },

    /// The host did not prepare the target directory before installing.
    #[error("Target directory does not exist: {} (workspace not installed?)", path.display())]
    TargetNotPrepared { path: PathBuf },

    #[error("Invalid platform descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Cache entry is corrupt: {} ({reason})", path.display())]
    CorruptCacheEntry { path: PathBuf, reason: String },

    #[error("Tool '{name}' not found at {}", path.display())]
    ToolNotFound { name: String, path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BinaryError {
    /// Wraps an I/O error together with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Returns true for failures worth retrying with a fresh download.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Download { .. } | Self::Extraction { .. })
    }
}
