//! Binary catalog with hardcoded per-platform download descriptors.
//!
//! Each platform maps to the archives that carry the `ffmpeg` and `ffprobe`
//! executables and the location of both inside the extracted archive.

use super::error::Result;
use super::types::{FileSpec, Platform, PlatformDescriptor, RemoteSource};

// ============================================================================
// Download Locations
// ============================================================================

const WINDOWS_URL: &str = "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-win64-gpl-shared.zip";

const LINUX_URL: &str = "https://github.com/BtbN/FFmpeg-Builds/releases/download/latest/ffmpeg-master-latest-linux64-gpl.tar.xz";

const MACOS_FFMPEG_URL: &str = "https://evermeet.cx/ffmpeg/ffmpeg-8.0.zip";

const MACOS_FFPROBE_URL: &str = "https://evermeet.cx/ffmpeg/ffprobe-8.0.zip";

/// Names of the tools every descriptor provides.
pub const TOOL_NAMES: &[&str] = &["ffmpeg", "ffprobe"];

// ============================================================================
// Resolution
// ============================================================================

/// Returns the descriptor for the running OS.
///
/// Fails with `UnsupportedPlatform` when the OS is not Windows, Linux or macOS.
pub fn resolve() -> Result<PlatformDescriptor> {
    Ok(descriptor_for(Platform::detect()?))
}

/// Returns the descriptor declared for `platform`.
pub fn descriptor_for(platform: Platform) -> PlatformDescriptor {
    let sources = match platform {
        Platform::Windows => vec![RemoteSource::new(
            WINDOWS_URL,
            vec![
                FileSpec::new("bin/ffmpeg.exe", "ffmpeg.exe"),
                FileSpec::new("bin/ffprobe.exe", "ffprobe.exe"),
            ],
        )],
        Platform::Linux => vec![RemoteSource::new(
            LINUX_URL,
            vec![
                FileSpec::new("bin/ffmpeg", "ffmpeg"),
                FileSpec::new("bin/ffprobe", "ffprobe"),
            ],
        )],
        // evermeet ships one bare executable per zip
        Platform::MacOs => vec![
            RemoteSource::new(MACOS_FFMPEG_URL, vec![FileSpec::new("ffmpeg", "ffmpeg")]),
            RemoteSource::new(
                MACOS_FFPROBE_URL,
                vec![FileSpec::new("ffprobe", "ffprobe")],
            ),
        ],
    };

    PlatformDescriptor::new(sources)
}

/// Returns the on-disk file name of a tool on the current OS.
///
/// - Windows: `ffmpeg.exe`
/// - Linux/macOS: `ffmpeg`
pub fn tool_file_name(name: &str) -> String {
    tool_file_name_for(name, cfg!(windows))
}

fn tool_file_name_for(name: &str, windows: bool) -> String {
    if windows && !name.to_lowercase().ends_with(".exe") {
        format!("{}.exe", name)
    } else {
        name.to_string()
    }
}
