use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use quiver_common::config::{CachePolicy, ChecksumAlgorithm, Config};
use quiver_common::error::{QuiverError, Result};
use quiver_common::events::{EventSender, FetchEvent};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::cache::Cache;
use crate::checksum;
use crate::download::{http_date, Conditional, Downloader, FetchResponse};
use crate::lock::{FileLock, KeyedLocks};

/// Why we are about to touch the network for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    /// Only because the local file is absent.
    IfMissing,
    /// Unconditionally.
    Force,
    /// Conditional revalidation of an existing file.
    Revalidate,
}

/// The cache-aware fetch pipeline: policy evaluation, single-flight
/// locking, checksum verification and atomic publication.
///
/// For a given (cache root, URL) pair at most one download runs at any
/// instant across threads and processes; concurrent callers wait on the
/// locks and then re-examine the cache state before deciding to fetch.
pub struct FileFetcher {
    config: Arc<Config>,
    cache: Cache,
    locks: KeyedLocks,
    downloader: Downloader,
    events: EventSender,
}

impl FileFetcher {
    pub fn new(config: Config, events: EventSender) -> Result<Self> {
        let config = Arc::new(config);
        let cache = Cache::new(config.cache_root.clone(), config.ttl);
        let downloader = Downloader::new(Arc::clone(&config))?;
        Ok(Self {
            config,
            cache,
            locks: KeyedLocks::new(),
            downloader,
            events,
        })
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Fetch one URL under the configured policy list. `changing` marks
    /// URLs whose content may legitimately change (snapshots), subject to
    /// TTL-based revalidation.
    pub async fn fetch(
        &self,
        url: &Url,
        changing: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        self.fetch_with_policies(&self.config.policies, url, changing, cancel)
            .await
    }

    /// Like [`FileFetcher::fetch`] with an explicit policy chain: the
    /// first policy that yields a file wins.
    pub async fn fetch_with_policies(
        &self,
        policies: &[CachePolicy],
        url: &Url,
        changing: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.cache.local_path(url)?;
        for policy in policies {
            if let Some(found) = self
                .apply_policy(*policy, url, &path, changing, true, cancel)
                .await?
            {
                return Ok(found);
            }
        }
        Err(QuiverError::NotInCache(url.to_string()))
    }

    fn apply_policy<'a>(
        &'a self,
        policy: CachePolicy,
        url: &'a Url,
        path: &'a Path,
        changing: bool,
        verify: bool,
        cancel: &'a CancellationToken,
    ) -> futures::future::BoxFuture<'a, Result<Option<PathBuf>>> {
        Box::pin(async move { self.apply_policy_inner(policy, url, path, changing, verify, cancel).await })
    }

    async fn apply_policy_inner(
        &self,
        policy: CachePolicy,
        url: &Url,
        path: &Path,
        changing: bool,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<Option<PathBuf>> {
        match policy {
            CachePolicy::LocalOnly => {
                if path.is_file() {
                    let _ = self.events.send(FetchEvent::CacheHit {
                        url: url.to_string(),
                        path: path.to_path_buf(),
                    });
                    Ok(Some(path.to_path_buf()))
                } else {
                    Ok(None)
                }
            }
            CachePolicy::FetchMissing => {
                if path.is_file() {
                    let _ = self.events.send(FetchEvent::CacheHit {
                        url: url.to_string(),
                        path: path.to_path_buf(),
                    });
                    return Ok(Some(path.to_path_buf()));
                }
                self.download(TransferMode::IfMissing, url, path, verify, cancel)
                    .await
                    .map(Some)
            }
            CachePolicy::Update => self
                .download(TransferMode::Force, url, path, verify, cancel)
                .await
                .map(Some),
            CachePolicy::LocalUpdate | CachePolicy::LocalUpdateChanging => {
                if !path.is_file() {
                    return Ok(None);
                }
                let needs_check = policy == CachePolicy::LocalUpdate || changing;
                if !needs_check || self.cache.is_fresh(path) {
                    let _ = self.events.send(FetchEvent::CacheHit {
                        url: url.to_string(),
                        path: path.to_path_buf(),
                    });
                    return Ok(Some(path.to_path_buf()));
                }
                self.download(TransferMode::Revalidate, url, path, verify, cancel)
                    .await
                    .map(Some)
            }
        }
    }

    /// Take both locks, re-examine, then transfer.
    async fn download(
        &self,
        mode: TransferMode,
        url: &Url,
        path: &Path,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let _in_process = self.locks.lock(path).await;
        let _cross_process =
            FileLock::acquire(&Cache::lock_path(path), self.config.lock_policy, cancel).await?;

        // Somebody else may have finished the same work while we waited.
        match mode {
            TransferMode::IfMissing if path.is_file() => {
                debug!(url = %url, "file appeared while waiting for lock");
                return Ok(path.to_path_buf());
            }
            TransferMode::Revalidate if self.cache.is_fresh(path) => {
                debug!(url = %url, "revalidated by another fetch while waiting");
                return Ok(path.to_path_buf());
            }
            _ => {}
        }

        match self.transfer(mode, url, path, verify, cancel).await {
            Ok(result) => Ok(result),
            Err(error) => {
                let _ = self
                    .events
                    .send(FetchEvent::download_failed(url.to_string(), &error));
                Err(error)
            }
        }
    }

    async fn transfer(
        &self,
        mode: TransferMode,
        url: &Url,
        path: &Path,
        verify: bool,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let conditional = if mode == TransferMode::Revalidate {
            let if_modified_since = std::fs::metadata(path)
                .and_then(|m| m.modified())
                .ok()
                .map(http_date);
            Some(Conditional {
                if_modified_since,
                if_none_match: Cache::read_etag(path),
            })
        } else {
            None
        };

        let _ = self.events.send(FetchEvent::DownloadStarted {
            url: url.to_string(),
        });

        let response = self
            .downloader
            .get(url, conditional.as_ref(), cancel)
            .await?;
        let response = match response {
            FetchResponse::NotModified => {
                debug!(url = %url, "304, keeping cached copy");
                self.cache.touch_last_check(path)?;
                return Ok(path.to_path_buf());
            }
            FetchResponse::Body(response) => response,
        };

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let total = response.content_length();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = Cache::part_path(path);
        if part.exists() {
            std::fs::remove_file(&part)?;
        }

        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = std::fs::remove_file(&part);
                    return Err(QuiverError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(|e| QuiverError::TransportError {
                url: url.to_string(),
                reason: format!("body stream failed: {e}"),
            })?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            let _ = self.events.send(FetchEvent::DownloadProgress {
                url: url.to_string(),
                bytes: written,
                total,
            });
        }
        file.sync_all().await?;
        drop(file);

        // The checksum sidecar lands (through its own cache entry) before
        // the rename, so any observer of the final file also sees it.
        if verify {
            if let Err(error) = self.verify_part(mode, url, &part, cancel).await {
                let _ = std::fs::remove_file(&part);
                return Err(error);
            }
        }
        if let Some(etag) = etag {
            Cache::write_etag(path, &etag)?;
        }

        std::fs::rename(&part, path)?;
        self.cache.touch_last_check(path)?;

        let _ = self.events.send(FetchEvent::DownloadFinished {
            url: url.to_string(),
            path: path.to_path_buf(),
            size_bytes: written,
        });
        Ok(path.to_path_buf())
    }

    /// Walk the configured checksum preference list: a verified digest
    /// wins, a missing checksum file demotes to the next entry, `None`
    /// accepts the artifact as-is.
    async fn verify_part(
        &self,
        mode: TransferMode,
        url: &Url,
        part: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for preference in &self.config.checksums {
            let Some(algorithm) = preference else {
                debug!(url = %url, "accepting without checksum");
                return Ok(());
            };
            match self.fetch_checksum_file(mode, url, *algorithm, cancel).await {
                Ok(Some(expected)) => {
                    return checksum::verify(part, *algorithm, &expected, url.as_str());
                }
                Ok(None) => {
                    debug!(url = %url, ?algorithm, "unparseable checksum file, demoting");
                }
                Err(QuiverError::Cancelled) => return Err(QuiverError::Cancelled),
                Err(error) => {
                    debug!(url = %url, ?algorithm, %error, "checksum unavailable, demoting");
                }
            }
        }
        Err(QuiverError::Cache(format!(
            "no usable checksum for {url} and none-accepted not configured"
        )))
    }

    async fn fetch_checksum_file(
        &self,
        mode: TransferMode,
        url: &Url,
        algorithm: ChecksumAlgorithm,
        cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        let mut checksum_url = url.clone();
        checksum_url.set_path(&format!("{}.{}", url.path(), algorithm.extension()));
        let path = self.cache.local_path(&checksum_url)?;
        // Checksum files ride the same cache pipeline, minus verification
        // of themselves. A forced artifact download forces them too.
        let policy = match mode {
            TransferMode::IfMissing => CachePolicy::FetchMissing,
            TransferMode::Force | TransferMode::Revalidate => CachePolicy::Update,
        };
        // Boxed: this re-enters apply_policy, and recursive futures need
        // an indirection.
        let fetch: futures::future::BoxFuture<'_, Result<Option<PathBuf>>> =
            Box::pin(self.apply_policy(policy, &checksum_url, &path, false, false, cancel));
        let fetched = fetch
            .await?
            .ok_or_else(|| QuiverError::NotInCache(checksum_url.to_string()))?;
        let content = std::fs::read_to_string(fetched)?;
        Ok(checksum::parse_checksum_file(&content))
    }
}

impl std::fmt::Debug for FileFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileFetcher")
            .field("cache_root", &self.cache.root())
            .field("policies", &self.config.policies)
            .finish()
    }
}
