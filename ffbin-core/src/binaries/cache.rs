//! Content cache: resolves a descriptor to a published store entry.
//!
//! A hit returns the stored entry without any network access. A miss fetches
//! every source of the descriptor in order, extracts it in a scratch directory
//! inside the store, stages the declared files and publishes the entry.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::downloader::{verify_download, Fetch};
use super::error::{BinaryError, Result};
use super::extractor::Extract;
use super::store::{CacheEntry, CacheStore, StagedEntry};
use super::types::{CacheKey, PlatformDescriptor, RemoteSource};
use crate::config::MissingFilePolicy;

/// Fetch-on-miss cache over a [`CacheStore`].
pub struct ContentCache {
    store: CacheStore,
    fetcher: Arc<dyn Fetch>,
    extractor: Arc<dyn Extract>,
    missing_file_policy: MissingFilePolicy,
    /// Serializes misses within this process.
    fill_lock: Mutex<()>,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("root", &self.store.root())
            .field("missing_file_policy", &self.missing_file_policy)
            .finish()
    }
}

impl ContentCache {
    pub fn new(
        store: CacheStore,
        fetcher: Arc<dyn Fetch>,
        extractor: Arc<dyn Extract>,
        missing_file_policy: MissingFilePolicy,
    ) -> Self {
        Self {
            store,
            fetcher,
            extractor,
            missing_file_policy,
            fill_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Returns the published entry for a descriptor without fetching.
    pub fn lookup(&self, descriptor: &PlatformDescriptor) -> Result<Option<CacheEntry>> {
        descriptor.validate()?;
        self.store.get(&CacheKey::compute(descriptor)?)
    }

    /// Returns the entry for `descriptor`, downloading it on a miss.
    pub async fn get_or_fetch(&self, descriptor: &PlatformDescriptor) -> Result<CacheEntry> {
        descriptor.validate()?;
        let key = CacheKey::compute(descriptor)?;

        if let Some(entry) = self.store.get(&key)? {
            debug!("Cache hit for {}", key);
            return self.check_complete(entry, descriptor);
        }

        let _guard = self.fill_lock.lock().await;

        // Another task may have filled the entry while we waited
        if let Some(entry) = self.store.get(&key)? {
            debug!("Cache hit for {} after waiting", key);
            return self.check_complete(entry, descriptor);
        }

        info!(
            "Cache miss for {}, fetching {} source(s)",
            key,
            descriptor.sources.len()
        );

        let mut staged = self.store.stage(&key)?;
        for source in &descriptor.sources {
            self.fill_from_source(source, &mut staged).await?;
        }

        // An entry without any files would install nothing and still succeed
        if staged.names().is_empty() {
            return Err(first_missing(descriptor, |_| true));
        }

        let urls: Vec<String> = descriptor.sources.iter().map(|s| s.url.clone()).collect();
        staged.publish(&urls)
    }

    /// Applies the missing-file policy to an entry read from the store.
    ///
    /// Entries published under `Warn` may lack declared files; they are only
    /// served as-is while the policy is still `Warn`.
    fn check_complete(
        &self,
        entry: CacheEntry,
        descriptor: &PlatformDescriptor,
    ) -> Result<CacheEntry> {
        let is_missing = |name: &str| entry.file(name).is_none();

        if descriptor.output_names().any(is_missing) {
            if self.missing_file_policy == MissingFilePolicy::Fail {
                return Err(first_missing(descriptor, is_missing));
            }
            for name in descriptor.output_names().filter(|n| is_missing(n)) {
                warn!("Cache entry {} has no {}", entry.key, name);
            }
        }

        Ok(entry)
    }

    async fn fill_from_source(&self, source: &RemoteSource, staged: &mut StagedEntry) -> Result<()> {
        let scratch = self.store.scratch("fetch-")?;
        let download_dir = scratch.path().join("download");
        let extract_dir = scratch.path().join("extract");

        let archive = self.fetcher.fetch(&source.url, &download_dir).await?;
        verify_download(&source.url, &archive)?;

        let extractor = Arc::clone(&self.extractor);
        let task_archive = archive.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<HashMap<String, PathBuf>> {
            let root = extractor.extract(&task_archive, &extract_dir)?;
            list_files(&root)
        })
        .await
        .map_err(|e| BinaryError::Extraction {
            path: archive.clone(),
            reason: format!("extraction task failed: {}", e),
        })??;

        debug!(
            "Extracted {} file(s) from {}",
            files.len(),
            archive.display()
        );

        for spec in &source.files {
            match files.get(&spec.normalized_archive_path()) {
                Some(path) => {
                    staged.put(path, &spec.output_name)?;
                }
                None if self.missing_file_policy == MissingFilePolicy::Warn => {
                    warn!(
                        "Archive from {} does not contain '{}', caching without {}",
                        source.url, spec.archive_path, spec.output_name
                    );
                }
                None => {
                    return Err(BinaryError::MissingExpectedFile {
                        url: source.url.clone(),
                        archive_path: spec.archive_path.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Builds `MissingExpectedFile` for the first declared file matching `is_missing`.
fn first_missing<F>(descriptor: &PlatformDescriptor, is_missing: F) -> BinaryError
where
    F: Fn(&str) -> bool,
{
    descriptor
        .sources
        .iter()
        .flat_map(|source| source.files.iter().map(move |file| (source, file)))
        .find(|(_, file)| is_missing(&file.output_name))
        .map(|(source, file)| BinaryError::MissingExpectedFile {
            url: source.url.clone(),
            archive_path: file.archive_path.clone(),
        })
        .unwrap_or_else(|| {
            BinaryError::InvalidDescriptor("descriptor declares no files".to_string())
        })
}

/// Maps the `/`-joined path of every regular file below `root` to its location.
///
/// A root that is itself a file maps from its own file name.
fn list_files(root: &Path) -> Result<HashMap<String, PathBuf>> {
    let mut files = HashMap::new();

    if root.is_file() {
        if let Some(name) = root.file_name().and_then(|n| n.to_str()) {
            files.insert(name.to_string(), root.to_path_buf());
        }
        return Ok(files);
    }

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir).map_err(|e| BinaryError::io(&dir, e))? {
            let entry = entry.map_err(|e| BinaryError::io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| BinaryError::io(&path, e))?;

            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                if let Some(relative) = relative_key(root, &path) {
                    files.insert(relative, path);
                }
            }
        }
    }

    Ok(files)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Option<Vec<&str>> = relative.iter().map(|c| c.to_str()).collect();
    Some(parts?.join("/"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::binaries::extractor::ArchiveExtractor;
    use crate::binaries::paths;
    use crate::binaries::types::FileSpec;
    use async_trait::async_trait;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    pub(crate) fn tar_xz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(name).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap().into_inner()
    }

    /// Serves a fixed body for every URL and counts the calls.
    pub(crate) struct CountingFetcher {
        pub calls: AtomicUsize,
        body: Vec<u8>,
    }

    impl CountingFetcher {
        pub(crate) fn new(body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                body,
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for CountingFetcher {
        async fn fetch(&self, url: &str, dest_dir: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let name = url.rsplit('/').next().unwrap_or("download");
            fs::create_dir_all(dest_dir).unwrap();
            let dest = dest_dir.join(name);
            fs::write(&dest, &self.body).unwrap();
            Ok(dest)
        }
    }

    struct CountingExtractor {
        calls: AtomicUsize,
    }

    impl Extract for CountingExtractor {
        fn extract(&self, archive: &Path, dest: &Path) -> Result<PathBuf> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ArchiveExtractor.extract(archive, dest)
        }
    }

    fn linux_like_descriptor() -> PlatformDescriptor {
        PlatformDescriptor::new(vec![RemoteSource::new(
            "http://x/f.tar.xz",
            vec![
                FileSpec::new("bin/ffmpeg", "ffmpeg"),
                FileSpec::new("bin/ffprobe", "ffprobe"),
            ],
        )])
    }

    fn cache_with(
        root: &Path,
        fetcher: Arc<dyn Fetch>,
        policy: MissingFilePolicy,
    ) -> ContentCache {
        ContentCache::new(
            CacheStore::new(root),
            fetcher,
            Arc::new(ArchiveExtractor),
            policy,
        )
    }

    fn scratch_is_empty(root: &Path) -> bool {
        fs::read_dir(paths::scratch_dir(root))
            .map(|mut rd| rd.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_miss_then_hit_avoids_network() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(tar_xz_bytes(&[
            ("ffmpeg-linux64/bin/ffmpeg", b"ffmpeg-bin"),
            ("ffmpeg-linux64/bin/ffprobe", b"ffprobe-bin"),
            ("ffmpeg-linux64/LICENSE.txt", b"GPL"),
        ]));
        let cache = cache_with(temp.path(), fetcher.clone(), MissingFilePolicy::Fail);
        let descriptor = linux_like_descriptor();

        let first = cache.get_or_fetch(&descriptor).await.unwrap();
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(first.files.len(), 2);
        assert_eq!(
            fs::read(&first.file("ffmpeg").unwrap().path).unwrap(),
            b"ffmpeg-bin"
        );
        assert_eq!(
            fs::read(&first.file("ffprobe").unwrap().path).unwrap(),
            b"ffprobe-bin"
        );

        let second = cache.get_or_fetch(&descriptor).await.unwrap();
        assert_eq!(fetcher.calls(), 1, "cache hit must not fetch");
        assert_eq!(first, second);
        assert!(scratch_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_lookup_does_not_fetch() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(Vec::new());
        let cache = cache_with(temp.path(), fetcher.clone(), MissingFilePolicy::Fail);

        assert!(cache.lookup(&linux_like_descriptor()).unwrap().is_none());
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_zero_byte_download_is_download_error() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(Vec::new());
        let extractor = Arc::new(CountingExtractor {
            calls: AtomicUsize::new(0),
        });
        let cache = ContentCache::new(
            CacheStore::new(temp.path()),
            fetcher.clone(),
            extractor.clone(),
            MissingFilePolicy::Fail,
        );

        let result = cache.get_or_fetch(&linux_like_descriptor()).await;

        match result {
            Err(BinaryError::Download { url, .. }) => assert_eq!(url, "http://x/f.tar.xz"),
            other => panic!("expected Download error, got {:?}", other),
        }
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert!(cache.store().entries().unwrap().is_empty());
        assert!(scratch_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_missing_file_fails_by_default() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(tar_xz_bytes(&[("root/bin/ffmpeg", b"x")]));
        let cache = cache_with(temp.path(), fetcher, MissingFilePolicy::Fail);

        match cache.get_or_fetch(&linux_like_descriptor()).await {
            Err(BinaryError::MissingExpectedFile { url, archive_path }) => {
                assert_eq!(url, "http://x/f.tar.xz");
                assert_eq!(archive_path, "bin/ffprobe");
            }
            other => panic!("expected MissingExpectedFile, got {:?}", other),
        }
        assert!(cache.store().entries().unwrap().is_empty());
        assert!(scratch_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_missing_file_warn_policy_publishes_partial_entry() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(tar_xz_bytes(&[("root/bin/ffmpeg", b"x")]));
        let cache = cache_with(temp.path(), fetcher, MissingFilePolicy::Warn);

        let entry = cache.get_or_fetch(&linux_like_descriptor()).await.unwrap();

        assert_eq!(entry.files.len(), 1);
        assert!(entry.file("ffmpeg").is_some());
        assert!(entry.file("ffprobe").is_none());
    }

    #[tokio::test]
    async fn test_partial_entry_is_rejected_under_fail_policy() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(tar_xz_bytes(&[("root/bin/ffmpeg", b"x")]));
        let descriptor = linux_like_descriptor();

        let lenient = cache_with(temp.path(), fetcher.clone(), MissingFilePolicy::Warn);
        lenient.get_or_fetch(&descriptor).await.unwrap();

        let strict = cache_with(temp.path(), fetcher.clone(), MissingFilePolicy::Fail);
        match strict.get_or_fetch(&descriptor).await {
            Err(BinaryError::MissingExpectedFile { url, archive_path }) => {
                assert_eq!(url, "http://x/f.tar.xz");
                assert_eq!(archive_path, "bin/ffprobe");
            }
            other => panic!("expected MissingExpectedFile, got {:?}", other),
        }
        assert_eq!(fetcher.calls(), 1);

        // Still served while the policy allows it
        let entry = lenient.get_or_fetch(&descriptor).await.unwrap();
        assert_eq!(entry.files.len(), 1);
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_warn_policy_never_publishes_empty_entry() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(tar_xz_bytes(&[("root/README", b"x")]));
        let cache = cache_with(temp.path(), fetcher, MissingFilePolicy::Warn);

        match cache.get_or_fetch(&linux_like_descriptor()).await {
            Err(BinaryError::MissingExpectedFile { archive_path, .. }) => {
                assert_eq!(archive_path, "bin/ffmpeg");
            }
            other => panic!("expected MissingExpectedFile, got {:?}", other),
        }
        assert!(cache.store().entries().unwrap().is_empty());
        assert!(scratch_is_empty(temp.path()));
    }

    #[tokio::test]
    async fn test_bare_executable_zip() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(zip_bytes(&[("ffmpeg", b"mach-o")]));
        let cache = cache_with(temp.path(), fetcher, MissingFilePolicy::Fail);
        let descriptor = PlatformDescriptor::new(vec![RemoteSource::new(
            "https://evermeet.cx/ffmpeg/ffmpeg-8.0.zip",
            vec![FileSpec::new("ffmpeg", "ffmpeg")],
        )]);

        let entry = cache.get_or_fetch(&descriptor).await.unwrap();
        assert_eq!(fs::read(&entry.files[0].path).unwrap(), b"mach-o");
    }

    #[tokio::test]
    async fn test_unsupported_archive() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(b"Rar!".to_vec());
        let cache = cache_with(temp.path(), fetcher, MissingFilePolicy::Fail);
        let descriptor = PlatformDescriptor::new(vec![RemoteSource::new(
            "http://x/f.rar",
            vec![FileSpec::new("bin/ffmpeg", "ffmpeg")],
        )]);

        assert!(matches!(
            cache.get_or_fetch(&descriptor).await,
            Err(BinaryError::UnsupportedArchive { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_descriptor_never_fetches() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(Vec::new());
        let cache = cache_with(temp.path(), fetcher.clone(), MissingFilePolicy::Fail);

        let result = cache.get_or_fetch(&PlatformDescriptor::new(vec![])).await;
        assert!(matches!(result, Err(BinaryError::InvalidDescriptor(_))));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let temp = TempDir::new().unwrap();
        let fetcher = CountingFetcher::new(tar_xz_bytes(&[
            ("r/bin/ffmpeg", b"a"),
            ("r/bin/ffprobe", b"b"),
        ]));
        let cache = Arc::new(cache_with(
            temp.path(),
            fetcher.clone(),
            MissingFilePolicy::Fail,
        ));
        let descriptor = linux_like_descriptor();

        let (a, b) = tokio::join!(
            cache.get_or_fetch(&descriptor),
            cache.get_or_fetch(&descriptor)
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(fetcher.calls(), 1);
    }

    #[test]
    fn test_list_files_uses_slash_keys() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("root");
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::write(root.join("bin").join("ffmpeg"), b"x").unwrap();
        fs::write(root.join("README"), b"y").unwrap();

        let files = list_files(&root).unwrap();
        assert_eq!(files.len(), 2);
        assert_eq!(files["bin/ffmpeg"], root.join("bin").join("ffmpeg"));
        assert!(files.contains_key("README"));
    }
}
