use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use quiver_common::config::ChecksumAlgorithm;
use quiver_common::error::{QuiverError, Result};
use tracing::debug;
use url::Url;

/// Suffixes of the sidecar files kept next to every cached artifact.
pub const PART_SUFFIX: &str = "part";
pub const LOCK_SUFFIX: &str = "lock";
pub const LAST_CHECK_SUFFIX: &str = "lastCheck";
pub const ETAG_SUFFIX: &str = "etag";

/// The content-addressed local store: `root/<scheme>/<host>/<path>`, query
/// components encoded into the file name. Entries outlive any single run;
/// everything mutable about an entry lives in its sidecars.
#[derive(Debug, Clone)]
pub struct Cache {
    root: PathBuf,
    ttl: Duration,
}

impl Cache {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Map a URL to its place in the cache. The path is kept verbatim (no
    /// percent-decoding); a query string is folded into the file name as a
    /// deterministic `?q=<urlencoded>` suffix.
    pub fn local_path(&self, url: &Url) -> Result<PathBuf> {
        let host = url
            .host_str()
            .ok_or_else(|| QuiverError::Cache(format!("URL without host: {url}")))?;
        let mut path = self.root.join(url.scheme());
        match url.port() {
            Some(port) => path.push(format!("{host}:{port}")),
            None => path.push(host),
        }
        for segment in url.path().split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        if let Some(query) = url.query() {
            let encoded: String = url::form_urlencoded::byte_serialize(query.as_bytes()).collect();
            let file = match path.file_name() {
                Some(name) => format!("{}?q={encoded}", name.to_string_lossy()),
                None => format!("?q={encoded}"),
            };
            path.set_file_name(file);
        }
        Ok(path)
    }

    fn sidecar(path: &Path, suffix: &str) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        path.with_file_name(format!("{name}.{suffix}"))
    }

    pub fn part_path(path: &Path) -> PathBuf {
        Self::sidecar(path, PART_SUFFIX)
    }

    pub fn lock_path(path: &Path) -> PathBuf {
        Self::sidecar(path, LOCK_SUFFIX)
    }

    pub fn last_check_path(path: &Path) -> PathBuf {
        Self::sidecar(path, LAST_CHECK_SUFFIX)
    }

    pub fn etag_path(path: &Path) -> PathBuf {
        Self::sidecar(path, ETAG_SUFFIX)
    }

    pub fn checksum_path(path: &Path, algorithm: ChecksumAlgorithm) -> PathBuf {
        Self::sidecar(path, algorithm.extension())
    }

    /// Freshness gate for changing artifacts: the `.lastCheck` sidecar's
    /// mtime against the TTL. A missing sidecar means stale.
    pub fn is_fresh(&self, path: &Path) -> bool {
        let last_check = Self::last_check_path(path);
        let Ok(metadata) = std::fs::metadata(&last_check) else {
            return false;
        };
        let Ok(modified) = metadata.modified() else {
            return false;
        };
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age <= self.ttl,
            // Clock went backwards; treat as fresh.
            Err(_) => true,
        }
    }

    /// Record a successful freshness probe.
    pub fn touch_last_check(&self, path: &Path) -> Result<()> {
        let last_check = Self::last_check_path(path);
        if let Some(parent) = last_check.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Rewriting the file bumps the mtime, which is all the gate reads.
        std::fs::write(&last_check, b"")?;
        debug!(path = %last_check.display(), "bumped lastCheck");
        Ok(())
    }

    pub fn read_etag(path: &Path) -> Option<String> {
        std::fs::read_to_string(Self::etag_path(path))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn write_etag(path: &Path, etag: &str) -> Result<()> {
        std::fs::write(Self::etag_path(path), etag)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> Cache {
        Cache::new("/cache", Duration::from_secs(24 * 3600))
    }

    #[test]
    fn layout_preserves_scheme_host_path() {
        let url = Url::parse("https://repo.example.com/org/acme/widget/1.0/widget-1.0.jar")
            .unwrap();
        assert_eq!(
            cache().local_path(&url).unwrap(),
            PathBuf::from("/cache/https/repo.example.com/org/acme/widget/1.0/widget-1.0.jar")
        );
    }

    #[test]
    fn layout_keeps_nonstandard_port() {
        let url = Url::parse("http://repo.example.com:8081/a/b.jar").unwrap();
        assert_eq!(
            cache().local_path(&url).unwrap(),
            PathBuf::from("/cache/http/repo.example.com:8081/a/b.jar")
        );
    }

    #[test]
    fn layout_encodes_query_deterministically() {
        let url = Url::parse("https://repo.example.com/a/b.jar?rev=1&kind=x").unwrap();
        let path = cache().local_path(&url).unwrap();
        assert_eq!(
            path,
            PathBuf::from("/cache/https/repo.example.com/a/b.jar?q=rev%3D1%26kind%3Dx")
        );
        // Deterministic: same URL, same path.
        assert_eq!(path, cache().local_path(&url).unwrap());
    }

    #[test]
    fn layout_rejects_hostless_urls() {
        let url = Url::parse("file:///tmp/x.jar").unwrap();
        assert!(cache().local_path(&url).is_err());
    }

    #[test]
    fn sidecar_names() {
        let path = Path::new("/cache/https/h/a.jar");
        assert_eq!(
            Cache::part_path(path),
            PathBuf::from("/cache/https/h/a.jar.part")
        );
        assert_eq!(
            Cache::lock_path(path),
            PathBuf::from("/cache/https/h/a.jar.lock")
        );
        assert_eq!(
            Cache::last_check_path(path),
            PathBuf::from("/cache/https/h/a.jar.lastCheck")
        );
        assert_eq!(
            Cache::checksum_path(path, ChecksumAlgorithm::Sha1),
            PathBuf::from("/cache/https/h/a.jar.sha1")
        );
    }

    #[test]
    fn freshness_follows_last_check_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path(), Duration::from_secs(3600));
        let artifact = dir.path().join("a.jar");
        std::fs::write(&artifact, b"bytes").unwrap();

        // No sidecar yet: stale.
        assert!(!cache.is_fresh(&artifact));

        cache.touch_last_check(&artifact).unwrap();
        assert!(cache.is_fresh(&artifact));

        // Zero TTL: everything is stale.
        let strict = Cache::new(dir.path(), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(20));
        assert!(!strict.is_fresh(&artifact));
    }

    #[test]
    fn etag_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("a.jar");
        assert_eq!(Cache::read_etag(&artifact), None);
        Cache::write_etag(&artifact, "\"abc123\"").unwrap();
        assert_eq!(Cache::read_etag(&artifact).as_deref(), Some("\"abc123\""));
    }
}
