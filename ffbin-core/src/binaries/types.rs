//! Core types for binary management.
//!
//! This module defines the foundational types used across the binaries
//! infrastructure: platform detection, archive formats, remote source
//! descriptors and the cache key derived from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use super::error::{BinaryError, Result};

// ============================================================================
// Platform Detection
// ============================================================================

/// Operating system family a descriptor is declared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
}

impl Platform {
    /// Returns all known platforms.
    pub fn all() -> &'static [Platform] {
        &[Self::Windows, Self::Linux, Self::MacOs]
    }

    /// Detects the current platform at compile time.
    ///
    /// Fails with [`BinaryError::UnsupportedPlatform`] on any other OS.
    pub fn detect() -> Result<Self> {
        Self::from_os(std::env::consts::OS)
    }

    /// Maps an OS identity string (as in `std::env::consts::OS`) to a platform.
    pub fn from_os(os: &str) -> Result<Self> {
        match os {
            "windows" => Ok(Self::Windows),
            "linux" => Ok(Self::Linux),
            "macos" => Ok(Self::MacOs),
            other => Err(BinaryError::UnsupportedPlatform {
                os: other.to_string(),
            }),
        }
    }

    /// Returns a human-readable description of the platform.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Windows => "Windows",
            Self::Linux => "Linux",
            Self::MacOs => "macOS",
        }
    }

    /// Returns true if installed binaries need the execute bit set.
    pub fn needs_exec_bits(&self) -> bool {
        !matches!(self, Self::Windows)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

// ============================================================================
// Archive Formats
// ============================================================================

/// Archive format of a downloaded file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// XZ-compressed tar archive (.tar.xz, .txz)
    TarXz,
    /// ZIP archive (.zip)
    Zip,
}

impl ArchiveFormat {
    /// Infers the archive format from a file name or URL.
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    /// Infers the archive format from the file name of a path.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.file_name()
            .and_then(|n| n.to_str())
            .and_then(Self::from_name)
    }
}

// ============================================================================
// Remote Source Descriptors
// ============================================================================

/// A file to pick out of an extracted archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the extracted root, `/`-separated.
    pub archive_path: String,
    /// File name the file is cached and installed under.
    pub output_name: String,
}

impl FileSpec {
    pub fn new(archive_path: impl Into<String>, output_name: impl Into<String>) -> Self {
        Self {
            archive_path: archive_path.into(),
            output_name: output_name.into(),
        }
    }

    /// The archive path without leading, trailing or repeated separators.
    pub fn normalized_archive_path(&self) -> String {
        self.archive_path
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// A downloadable archive and the files to extract from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteSource {
    pub url: String,
    pub files: Vec<FileSpec>,
}

impl RemoteSource {
    pub fn new(url: impl Into<String>, files: Vec<FileSpec>) -> Self {
        Self {
            url: url.into(),
            files,
        }
    }
}

/// The ordered list of remote sources that make up one platform's binaries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformDescriptor {
    pub sources: Vec<RemoteSource>,
}

impl PlatformDescriptor {
    pub fn new(sources: Vec<RemoteSource>) -> Self {
        Self { sources }
    }

    /// Iterates over every declared output name, in declaration order.
    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.sources
            .iter()
            .flat_map(|s| s.files.iter().map(|f| f.output_name.as_str()))
    }

    /// Checks that the descriptor can be cached and installed.
    ///
    /// Output names must be plain, unique file names since they become
    /// entries in both the cache store and the target directory.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(BinaryError::InvalidDescriptor(
                "descriptor has no sources".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.files.is_empty() {
                return Err(BinaryError::InvalidDescriptor(format!(
                    "source {} declares no files",
                    source.url
                )));
            }

            let mut archive_paths = HashSet::new();
            for file in &source.files {
                if file.normalized_archive_path().is_empty() {
                    return Err(BinaryError::InvalidDescriptor(format!(
                        "empty archive path in {}",
                        source.url
                    )));
                }
                if !archive_paths.insert(file.normalized_archive_path()) {
                    return Err(BinaryError::InvalidDescriptor(format!(
                        "archive path '{}' declared more than once in {}",
                        file.archive_path, source.url
                    )));
                }
                if !is_plain_file_name(&file.output_name) {
                    return Err(BinaryError::InvalidDescriptor(format!(
                        "output name '{}' must be a plain file name",
                        file.output_name
                    )));
                }
                if !seen.insert(file.output_name.as_str()) {
                    return Err(BinaryError::InvalidDescriptor(format!(
                        "output name '{}' declared more than once",
                        file.output_name
                    )));
                }
            }
        }

        Ok(())
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && name != super::store::ENTRY_MANIFEST
}

// ============================================================================
// Cache Key
// ============================================================================

/// Stable identifier of a descriptor's content.
///
/// SHA-256 over the canonical JSON form of the descriptor: object keys sorted,
/// no whitespace. Equal content always yields the same key no matter how the
/// descriptor was originally written down.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Computes the key for a descriptor.
    pub fn compute(descriptor: &PlatformDescriptor) -> Result<Self> {
        let value = serde_json::to_value(descriptor).map_err(|e| {
            BinaryError::InvalidDescriptor(format!("failed to serialize descriptor: {}", e))
        })?;
        Ok(Self::from_value(&value))
    }

    /// Computes the key for an arbitrary JSON document.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let canonical = canonicalize(value).to_string();
        let digest = Sha256::digest(canonical.as_bytes());
        Self(format!("{:x}", digest))
    }

    /// Wraps a key read back from disk, rejecting anything that is not a hex digest.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Rebuilds objects with their keys inserted in sorted order.
///
/// Holds even if `serde_json` is built with `preserve_order`.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key.as_str()]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
