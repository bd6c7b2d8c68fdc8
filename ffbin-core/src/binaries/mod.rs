//! Content-addressed download-and-link cache for the FFmpeg binaries.
//!
//! The binaries are downloaded once per user into a shared store and
//! hardlinked into every workspace `bin` directory that needs them, so
//! repeated installs cost neither bandwidth nor disk space.
//!
//! # Architecture
//!
//! - `types`: Core types (Platform, ArchiveFormat, PlatformDescriptor, CacheKey)
//! - `catalog`: Per-platform download descriptors and `resolve()`
//! - `downloader`: `Fetch` seam and the streaming HTTP fetcher
//! - `extractor`: `Extract` seam and archive extraction (zip, tar.xz)
//! - `store`: On-disk layout, staging and atomic publish
//! - `cache`: Fetch-on-miss lookup over the store
//! - `installer`: Hardlinking into target directories and removal
//! - `manager`: High-level API and host hooks
//! - `paths`: Cache and settings path resolution
//!
//! # Example
//!
//! ```ignore
//! use ffbin_core::binaries::BinaryManager;
//! use ffbin_core::config::Settings;
//!
//! let manager = BinaryManager::new(Settings::load())?;
//!
//! // Called by the host once the workspace directory exists
//! manager.on_installed(&bin_path).await?;
//!
//! let ffmpeg = manager.tool_path(&bin_path, "ffmpeg")?;
//! println!("ffmpeg installed at: {}", ffmpeg.display());
//! ```

pub mod cache;
pub mod catalog;
pub mod downloader;
pub mod error;
pub mod extractor;
pub mod installer;
pub mod manager;
pub mod paths;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use cache::ContentCache;
pub use catalog::{descriptor_for, resolve, tool_file_name, TOOL_NAMES};
pub use downloader::{DownloadProgress, Fetch, HttpFetcher};
pub use error::{BinaryError, Result};
pub use extractor::{ArchiveExtractor, Extract};
pub use installer::{link_or_copy, uninstall, Installer, LinkKind};
pub use manager::{BinaryManager, BinaryStatus, EntryState, InstalledFile};
pub use paths::{default_cache_dir, default_settings_path, CACHE_DIR_ENV};
pub use store::{CacheEntry, CacheStore, CachedFile, EntryManifest};
pub use types::{ArchiveFormat, CacheKey, FileSpec, Platform, PlatformDescriptor, RemoteSource};
