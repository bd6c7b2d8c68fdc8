//! ffbin Core Library
//!
//! This crate provides the core functionality for ffbin, a shared cache for
//! the FFmpeg binaries. It includes:
//!
//! - Per-platform download descriptors for `ffmpeg` and `ffprobe`
//! - Streaming downloads and archive extraction
//! - A content-addressed on-disk store with atomic publish
//! - Hardlink installation into workspace directories
//! - Configuration management (settings, environment overrides)

pub mod binaries;
pub mod config;

// Re-exports for convenience
pub use config::{MissingFilePolicy, Settings};

pub use binaries::{
    BinaryError, BinaryManager, BinaryStatus, CacheEntry, CacheKey, EntryState, FileSpec,
    Platform, PlatformDescriptor, RemoteSource, Result,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
