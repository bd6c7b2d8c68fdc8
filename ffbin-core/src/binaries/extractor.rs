//! Archive extraction for downloaded binary packages.
//!
//! This module unpacks `.zip` and `.tar.xz` archives, sets executable
//! permissions on Unix systems and reports the extracted root: the first
//! entry, by name, that the archive produced in the destination directory.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use super::error::{BinaryError, Result};
use super::types::ArchiveFormat;

// ============================================================================
// Extract Seam
// ============================================================================

/// Unpacks an archive file into a directory.
pub trait Extract: Send + Sync {
    /// Extracts `archive` into `dest` and returns the extracted root.
    ///
    /// The format is chosen from the archive's file name. Unsupported names
    /// fail before `dest` is created.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf>;
}

/// The built-in extractor for `.zip` and `.tar.xz` archives.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArchiveExtractor;

impl Extract for ArchiveExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf> {
        let format =
            ArchiveFormat::from_path(archive).ok_or_else(|| BinaryError::UnsupportedArchive {
                path: archive.to_path_buf(),
            })?;

        extract_archive(archive, dest, format)?;
        first_entry(archive, dest)
    }
}

// ============================================================================
// Archive Extraction
// ============================================================================

/// Extracts an archive to a destination directory.
///
/// # Arguments
///
/// * `archive_path` - Path to the archive file.
/// * `dest_dir` - Directory to extract into. Created if missing.
/// * `format` - The archive format.
pub fn extract_archive(archive_path: &Path, dest_dir: &Path, format: ArchiveFormat) -> Result<()> {
    info!(
        "Extracting {:?} archive {} to {}",
        format,
        archive_path.display(),
        dest_dir.display()
    );

    fs::create_dir_all(dest_dir).map_err(|e| BinaryError::io(dest_dir, e))?;

    match format {
        ArchiveFormat::Zip => extract_zip(archive_path, dest_dir),
        ArchiveFormat::TarXz => extract_tar_xz(archive_path, dest_dir),
    }
}

/// Returns the lexicographically first entry of `dest_dir`.
fn first_entry(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dest_dir).map_err(|e| BinaryError::io(dest_dir, e))? {
        let entry = entry.map_err(|e| BinaryError::io(dest_dir, e))?;
        names.push(entry.file_name());
    }

    names.sort();
    names
        .into_iter()
        .next()
        .map(|name| dest_dir.join(name))
        .ok_or_else(|| extraction_error(archive_path, "archive produced no entries"))
}

fn extraction_error(archive_path: &Path, reason: impl ToString) -> BinaryError {
    BinaryError::Extraction {
        path: archive_path.to_path_buf(),
        reason: reason.to_string(),
    }
}

// ============================================================================
// ZIP Extraction
// ============================================================================

fn extract_zip(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let fail = |e: &dyn std::fmt::Display| extraction_error(archive_path, e);

    let file = File::open(archive_path).map_err(|e| BinaryError::io(archive_path, e))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file)).map_err(|e| fail(&e))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| fail(&e))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!("Skipping unsafe path in zip: {}", entry.name());
                continue;
            }
        };

        let dest_path = dest_dir.join(&entry_path);

        if entry.is_dir() {
            fs::create_dir_all(&dest_path).map_err(|e| BinaryError::io(&dest_path, e))?;
            continue;
        }

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(|e| BinaryError::io(parent, e))?;
        }

        let mut outfile = File::create(&dest_path).map_err(|e| BinaryError::io(&dest_path, e))?;
        io::copy(&mut entry, &mut outfile).map_err(|e| fail(&e))?;

        #[cfg(unix)]
        set_unix_permissions(&dest_path, entry.unix_mode())?;
    }

    debug!("ZIP extraction complete");
    Ok(())
}

// ============================================================================
// TAR.XZ Extraction
// ============================================================================

fn extract_tar_xz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|e| BinaryError::io(archive_path, e))?;
    let decoder = xz2::read::XzDecoder::new(BufReader::new(file));
    extract_tar(decoder, archive_path, dest_dir)
}

fn extract_tar<R: Read>(reader: R, archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let fail = |e: &dyn std::fmt::Display| extraction_error(archive_path, e);

    let mut archive = tar::Archive::new(reader);
    let dest_dir_canonical = dest_dir
        .canonicalize()
        .map_err(|e| BinaryError::io(dest_dir, e))?;

    for entry_result in archive.entries().map_err(|e| fail(&e))? {
        let mut entry = entry_result.map_err(|e| fail(&e))?;
        let entry_type = entry.header().entry_type();

        // Links could point outside dest_dir; the binaries never need them
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!("Skipping link entry in tar archive");
            continue;
        }

        let path = entry.path().map_err(|e| fail(&e))?.into_owned();

        if path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
            warn!("Skipping unsafe path in tar: {:?}", path);
            continue;
        }

        let dest_path = dest_dir.join(&path);

        if !stays_within(&dest_path, &dest_dir_canonical)? {
            warn!("Skipping path that escapes {}: {:?}", dest_dir.display(), path);
            continue;
        }

        if entry_type.is_dir() {
            fs::create_dir_all(&dest_path).map_err(|e| BinaryError::io(&dest_path, e))?;
        } else if entry_type.is_file() {
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent).map_err(|e| BinaryError::io(parent, e))?;
            }

            let mut outfile =
                File::create(&dest_path).map_err(|e| BinaryError::io(&dest_path, e))?;
            io::copy(&mut entry, &mut outfile).map_err(|e| fail(&e))?;
            outfile.flush().map_err(|e| BinaryError::io(&dest_path, e))?;

            #[cfg(unix)]
            {
                if let Ok(mode) = entry.header().mode() {
                    set_unix_permissions(&dest_path, Some(mode))?;
                }
            }
        }
    }

    debug!("TAR extraction complete");
    Ok(())
}

/// Checks that `dest_path` resolves to a location under `root_canonical`.
fn stays_within(dest_path: &Path, root_canonical: &Path) -> Result<bool> {
    let resolved = if dest_path.exists() {
        dest_path
            .canonicalize()
            .map_err(|e| BinaryError::io(dest_path, e))?
    } else if let Some(parent) = dest_path.parent() {
        fs::create_dir_all(parent).map_err(|e| BinaryError::io(parent, e))?;
        parent
            .canonicalize()
            .map_err(|e| BinaryError::io(parent, e))?
            .join(dest_path.file_name().unwrap_or_default())
    } else {
        dest_path.to_path_buf()
    };

    Ok(resolved.starts_with(root_canonical))
}

// ============================================================================
// Unix Permissions
// ============================================================================

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(mode) = mode {
        if mode & 0o111 != 0 {
            let permissions = fs::Permissions::from_mode((mode & 0o7777) | 0o755);
            fs::set_permissions(path, permissions).map_err(|e| BinaryError::io(path, e))?;
        }
    }

    Ok(())
}

/// Adds the execute bits for user, group and other to a file.
///
/// Existing permission bits are kept. On Windows, this is a no-op.
#[allow(unused_variables)]
pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mut permissions = fs::metadata(path)
            .map_err(|e| BinaryError::io(path, e))?
            .permissions();
        permissions.set_mode(permissions.mode() | 0o111);
        fs::set_permissions(path, permissions).map_err(|e| BinaryError::io(path, e))?;

        debug!("Set executable permission on {}", path.display());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o755);

        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn write_tar_xz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let encoder = xz2::write::XzEncoder::new(file, 6);
        let mut builder = tar::Builder::new(encoder);

        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }

        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_extract_zip_bare_executable() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("ffmpeg-8.0.zip");
        let extract_dir = temp_dir.path().join("extracted");
        write_zip(&archive_path, &[("ffmpeg", b"\x7fELF fake")]);

        let root = ArchiveExtractor.extract(&archive_path, &extract_dir).unwrap();

        assert_eq!(root, extract_dir.join("ffmpeg"));
        assert!(root.is_file());
        assert_eq!(fs::read(&root).unwrap(), b"\x7fELF fake");
    }

    #[test]
    fn test_extract_zip_nested() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("test.zip");
        let extract_dir = temp_dir.path().join("extracted");
        write_zip(
            &archive_path,
            &[
                ("ffmpeg-win64/bin/ffmpeg.exe", b"MZ"),
                ("ffmpeg-win64/LICENSE.txt", b"GPL"),
            ],
        );

        let root = ArchiveExtractor.extract(&archive_path, &extract_dir).unwrap();

        assert_eq!(root, extract_dir.join("ffmpeg-win64"));
        assert!(root.join("bin/ffmpeg.exe").exists());
        assert_eq!(
            fs::read_to_string(root.join("LICENSE.txt")).unwrap(),
            "GPL"
        );
    }

    #[test]
    fn test_extract_tar_xz_nested() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("f.tar.xz");
        let extract_dir = temp_dir.path().join("extracted");
        write_tar_xz(
            &archive_path,
            &[
                ("ffmpeg-linux64/bin/ffmpeg", b"ffmpeg"),
                ("ffmpeg-linux64/bin/ffprobe", b"ffprobe"),
            ],
        );

        let root = ArchiveExtractor.extract(&archive_path, &extract_dir).unwrap();

        assert_eq!(root, extract_dir.join("ffmpeg-linux64"));
        assert_eq!(fs::read(root.join("bin/ffprobe")).unwrap(), b"ffprobe");
    }

    #[test]
    fn test_first_entry_is_lexicographic() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("two.tar.xz");
        let extract_dir = temp_dir.path().join("extracted");
        write_tar_xz(&archive_path, &[("zeta/file", b"z"), ("alpha/file", b"a")]);

        let root = ArchiveExtractor.extract(&archive_path, &extract_dir).unwrap();
        assert_eq!(root, extract_dir.join("alpha"));
    }

    #[test]
    fn test_unsupported_archive_leaves_destination_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("ffmpeg.rar");
        fs::write(&archive_path, b"Rar!").unwrap();
        let extract_dir = temp_dir.path().join("extracted");

        match ArchiveExtractor.extract(&archive_path, &extract_dir) {
            Err(BinaryError::UnsupportedArchive { path }) => assert_eq!(path, archive_path),
            other => panic!("expected UnsupportedArchive, got {:?}", other),
        }
        assert!(!extract_dir.exists());
    }

    #[test]
    fn test_corrupt_zip_is_extraction_error() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("broken.zip");
        fs::write(&archive_path, b"definitely not a zip").unwrap();

        let result = ArchiveExtractor.extract(&archive_path, &temp_dir.path().join("out"));
        assert!(matches!(result, Err(BinaryError::Extraction { .. })));
    }

    #[test]
    fn test_empty_archive_is_extraction_error() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("empty.tar.xz");
        write_tar_xz(&archive_path, &[]);

        let result = ArchiveExtractor.extract(&archive_path, &temp_dir.path().join("out"));
        match result {
            Err(BinaryError::Extraction { reason, .. }) => assert!(reason.contains("no entries")),
            other => panic!("expected Extraction error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_tar_preserves_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("f.tar.xz");
        let extract_dir = temp_dir.path().join("extracted");
        write_tar_xz(&archive_path, &[("bin/ffmpeg", b"x")]);

        ArchiveExtractor.extract(&archive_path, &extract_dir).unwrap();

        let mode = fs::metadata(extract_dir.join("bin/ffmpeg"))
            .unwrap()
            .permissions()
            .mode();
        assert_ne!(mode & 0o111, 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_make_executable_is_additive() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("ffprobe");
        fs::write(&file_path, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&file_path, fs::Permissions::from_mode(0o640)).unwrap();

        make_executable(&file_path).unwrap();

        let mode = fs::metadata(&file_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o751);
    }

    #[test]
    fn test_tar_symlink_escape_blocked() {
        let temp_dir = TempDir::new().unwrap();
        let archive_path = temp_dir.path().join("malicious.tar.xz");
        let extract_dir = temp_dir.path().join("extracted");
        let escape_target = temp_dir.path().join("escaped_file.txt");

        {
            let file = File::create(&archive_path).unwrap();
            let encoder = xz2::write::XzEncoder::new(file, 6);
            let mut builder = tar::Builder::new(encoder);

            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            builder
                .append_link(&mut header, "escape_link", "../escaped_file.txt")
                .unwrap();

            let data = b"This should NOT appear outside extraction dir!";
            let mut file_header = tar::Header::new_gnu();
            file_header.set_path("escape_link").unwrap();
            file_header.set_size(data.len() as u64);
            file_header.set_mode(0o644);
            file_header.set_cksum();
            builder.append(&file_header, &data[..]).unwrap();

            builder.into_inner().unwrap().finish().unwrap();
        }

        ArchiveExtractor.extract(&archive_path, &extract_dir).unwrap();

        assert!(
            !escape_target.exists(),
            "Symlink escape attack succeeded - file was written outside extraction dir!"
        );
        assert!(extract_dir.join("escape_link").is_file());
    }
}
