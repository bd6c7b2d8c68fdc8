//! Async archive fetcher with progress reporting and URL validation.
//!
//! This module provides the [`Fetch`] seam used by the content cache and its
//! production implementation, [`HttpFetcher`], which streams a response body
//! into a scratch directory using reqwest.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::redirect::Policy;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use super::error::{BinaryError, Result};
use crate::config::Settings;

/// Maximum number of redirects followed per download.
const MAX_REDIRECTS: usize = 10;

/// File name used when the URL path has no usable last segment.
const FALLBACK_FILE_NAME: &str = "download";

// ============================================================================
// Fetch Seam
// ============================================================================

/// Downloads a remote file into a directory.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Downloads `url` into `dest_dir` and returns the path of the written file.
    ///
    /// Implementations write exactly one file into `dest_dir`.
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// Checks that a fetched file exists and is not empty.
///
/// A zero-byte result is treated as a failed transfer, never as an empty archive.
pub fn verify_download(url: &str, path: &Path) -> Result<u64> {
    let len = std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| BinaryError::Download {
            url: url.to_string(),
            reason: format!("downloaded file {} is missing: {}", path.display(), e),
        })?;

    if len == 0 {
        return Err(BinaryError::Download {
            url: url.to_string(),
            reason: format!("downloaded file {} is empty", path.display()),
        });
    }

    Ok(len)
}

// ============================================================================
// URL Validation
// ============================================================================

/// Validates that a URL is safe for downloading.
///
/// Checks:
/// - URL scheme must be HTTPS (or HTTP when `allow_insecure_http` is set)
/// - Host must be in the allowed domain list, unless that list is empty
fn validate_url(url_str: &str, allowed_domains: &[String], allow_insecure_http: bool) -> Result<Url> {
    let invalid = |reason: String| BinaryError::Download {
        url: url_str.to_string(),
        reason,
    };

    let url = Url::parse(url_str).map_err(|e| invalid(format!("invalid URL: {}", e)))?;

    match url.scheme() {
        "https" => {}
        "http" if allow_insecure_http => {}
        other => return Err(invalid(format!("URL scheme '{}' is not allowed", other))),
    }

    let host = url
        .host_str()
        .ok_or_else(|| invalid("URL must have a host".to_string()))?;

    // Subdomains of an allowed domain are allowed too
    let is_allowed = allowed_domains.is_empty()
        || allowed_domains
            .iter()
            .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)));

    if !is_allowed {
        return Err(invalid(format!(
            "download domain not allowed: {}. Allowed: {:?}",
            host, allowed_domains
        )));
    }

    Ok(url)
}

/// Returns the file name a URL is saved under.
fn file_name_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
        .map(|name| name.to_string())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

// ============================================================================
// Download Progress
// ============================================================================

/// Progress information during a download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total bytes expected (if known from Content-Length header).
    pub total_bytes: Option<u64>,
    /// Progress percentage (0.0 to 100.0), or None if total is unknown.
    pub percent: Option<f32>,
}

impl DownloadProgress {
    fn new(bytes_downloaded: u64, total_bytes: Option<u64>) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_downloaded as f32 / total as f32) * 100.0
            } else {
                0.0
            }
        });

        Self {
            bytes_downloaded,
            total_bytes,
            percent,
        }
    }
}

/// Callback invoked with progress updates.
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

// ============================================================================
// HTTP Fetcher
// ============================================================================

/// Streams archives over HTTP(S) with reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    allowed_domains: Vec<String>,
    allow_insecure_http: bool,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("timeout", &self.timeout)
            .field("allowed_domains", &self.allowed_domains)
            .field("allow_insecure_http", &self.allow_insecure_http)
            .finish()
    }
}

impl HttpFetcher {
    /// Creates a fetcher configured from settings.
    pub fn new(settings: &Settings) -> Result<Self> {
        let timeout = settings.download_timeout();
        let client = reqwest::Client::builder()
            .redirect(Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|e| BinaryError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout,
            allowed_domains: settings.allowed_domains.clone(),
            allow_insecure_http: settings.allow_insecure_http,
            progress: None,
        })
    }

    /// Reports progress through `callback` on every received chunk.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn report(&self, progress: DownloadProgress) {
        if let Some(cb) = &self.progress {
            cb(progress);
        }
    }

    fn download_error(&self, url: &str, e: reqwest::Error) -> BinaryError {
        let reason = if e.is_timeout() {
            format!("timed out after {}s", self.timeout.as_secs())
        } else {
            e.to_string()
        };
        BinaryError::Download {
            url: url.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
        let parsed = validate_url(url, &self.allowed_domains, self.allow_insecure_http)?;
        let dest = dest_dir.join(file_name_from_url(&parsed));

        info!("Downloading {} to {}", url, dest.display());

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| BinaryError::io(dest_dir, e))?;

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| self.download_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BinaryError::Download {
                url: url.to_string(),
                reason: format!(
                    "server returned {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown error")
                ),
            });
        }

        let total_bytes = response.content_length();
        debug!("Content-Length: {:?}", total_bytes);

        let mut file = File::create(&dest)
            .await
            .map_err(|e| BinaryError::io(&dest, e))?;

        let mut stream = response.bytes_stream();
        let mut bytes_downloaded: u64 = 0;

        self.report(DownloadProgress::new(0, total_bytes));

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| self.download_error(url, e))?;

            file.write_all(&chunk)
                .await
                .map_err(|e| BinaryError::io(&dest, e))?;

            bytes_downloaded += chunk.len() as u64;
            self.report(DownloadProgress::new(bytes_downloaded, total_bytes));
        }

        file.flush().await.map_err(|e| BinaryError::io(&dest, e))?;
        drop(file);

        verify_download(url, &dest)?;

        info!(
            "Download complete: {} bytes written to {}",
            bytes_downloaded,
            dest.display()
        );

        Ok(dest)
    }
}
