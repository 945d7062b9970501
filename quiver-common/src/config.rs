use std::env;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::credentials::{self, Credential};
use crate::error::{QuiverError, Result};

/// Environment variables recognized when a builder field is left unset.
pub const ENV_CACHE: &str = "COURSIER_CACHE";
pub const ENV_TTL: &str = "COURSIER_TTL";
pub const ENV_MODE: &str = "COURSIER_MODE";
pub const ENV_CREDENTIALS: &str = "COURSIER_CREDENTIALS";

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_CONCURRENCY: usize = 6;
pub const DEFAULT_RETRY_COUNT: usize = 1;
pub const DEFAULT_SSL_RETRY_COUNT: usize = 3;
pub const DEFAULT_MAX_REDIRECTIONS: usize = 20;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// A rule governing whether and when to contact the network for a URL.
/// Policies are evaluated in caller order; the first that yields a result
/// wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachePolicy {
    /// Use a local file or fail with `NotInCache`.
    LocalOnly,
    /// Like `LocalOnly`, but revalidate changing URLs older than the TTL.
    LocalUpdateChanging,
    /// Revalidate every URL regardless of the changing flag.
    LocalUpdate,
    /// Unconditional re-download.
    Update,
    /// Download only when the local file is absent.
    FetchMissing,
}

/// Parse a `COURSIER_MODE`-style policy list. Tokens combine with commas
/// or spaces; each token expands to one or more policies.
pub fn parse_cache_mode(input: &str) -> Result<Vec<CachePolicy>> {
    let mut policies = Vec::new();
    for token in input.split([',', ' ']).filter(|t| !t.trim().is_empty()) {
        match token.trim() {
            "default" | "update-changing" => {
                policies.push(CachePolicy::LocalUpdateChanging);
                policies.push(CachePolicy::FetchMissing);
            }
            "update" => {
                policies.push(CachePolicy::LocalUpdate);
                policies.push(CachePolicy::FetchMissing);
            }
            "force" => policies.push(CachePolicy::Update),
            "missing" => policies.push(CachePolicy::FetchMissing),
            "offline" => policies.push(CachePolicy::LocalOnly),
            other => {
                return Err(QuiverError::Config(format!(
                    "unknown cache mode token '{other}'"
                )))
            }
        }
    }
    if policies.is_empty() {
        return Err(QuiverError::Config("empty cache mode".to_string()));
    }
    Ok(policies)
}

pub fn default_cache_policies() -> Vec<CachePolicy> {
    vec![CachePolicy::LocalUpdateChanging, CachePolicy::FetchMissing]
}

/// Parse durations of the `24h` / `30 min` / `3600s` / `2d` form.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let amount: u64 = digits
        .parse()
        .map_err(|_| QuiverError::Config(format!("malformed duration '{input}'")))?;
    let seconds = match unit.trim() {
        "" | "s" | "sec" | "second" | "seconds" => amount,
        "m" | "min" | "minute" | "minutes" => amount * 60,
        "h" | "hour" | "hours" => amount * 3600,
        "d" | "day" | "days" => amount * 86_400,
        other => {
            return Err(QuiverError::Config(format!(
                "unknown duration unit '{other}' in '{input}'"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// What a fetch does when another process holds the lock for its URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockPolicy {
    /// Wait for the holder to finish.
    #[default]
    Block,
    /// Fail immediately with a cache error.
    Fail,
}

/// Checksum algorithms understood by the cache. `None` in a preference
/// list means "accept without a checksum".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
}

impl ChecksumAlgorithm {
    /// Sidecar / remote-file extension.
    pub fn extension(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
        }
    }
}

pub fn default_checksums() -> Vec<Option<ChecksumAlgorithm>> {
    vec![Some(ChecksumAlgorithm::Sha1), None]
}

/// The explicit context value everything else receives. Process-wide
/// defaults (environment variables) are merely a convenience applied by
/// the builder for fields left unset.
#[derive(Debug, Clone)]
pub struct Config {
    pub cache_root: PathBuf,
    pub ttl: Duration,
    pub policies: Vec<CachePolicy>,
    pub credentials: Vec<Credential>,
    pub concurrency: usize,
    pub retry_count: usize,
    pub ssl_retry_count: usize,
    pub max_redirections: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Wall-clock budget wrapping all retries of one request.
    pub request_timeout: Option<Duration>,
    pub lock_policy: LockPolicy,
    pub checksums: Vec<Option<ChecksumAlgorithm>>,
    pub strict_conflicts: bool,
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn load() -> Result<Self> {
        Self::builder().build()
    }
}

#[derive(Debug, Default)]
pub struct ConfigBuilder {
    cache_root: Option<PathBuf>,
    ttl: Option<Duration>,
    policies: Option<Vec<CachePolicy>>,
    credentials: Option<Vec<Credential>>,
    concurrency: Option<usize>,
    retry_count: Option<usize>,
    ssl_retry_count: Option<usize>,
    max_redirections: Option<usize>,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    request_timeout: Option<Duration>,
    lock_policy: Option<LockPolicy>,
    checksums: Option<Vec<Option<ChecksumAlgorithm>>>,
    strict_conflicts: Option<bool>,
}

impl ConfigBuilder {
    pub fn cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = Some(root.into());
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn policies(mut self, policies: Vec<CachePolicy>) -> Self {
        self.policies = Some(policies);
        self
    }

    pub fn credentials(mut self, credentials: Vec<Credential>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    pub fn retry_count(mut self, count: usize) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn ssl_retry_count(mut self, count: usize) -> Self {
        self.ssl_retry_count = Some(count);
        self
    }

    pub fn max_redirections(mut self, count: usize) -> Self {
        self.max_redirections = Some(count);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = Some(policy);
        self
    }

    pub fn checksums(mut self, checksums: Vec<Option<ChecksumAlgorithm>>) -> Self {
        self.checksums = Some(checksums);
        self
    }

    pub fn strict_conflicts(mut self, strict: bool) -> Self {
        self.strict_conflicts = Some(strict);
        self
    }

    pub fn build(self) -> Result<Config> {
        let cache_root = match self.cache_root {
            Some(root) => root,
            None => match env::var(ENV_CACHE) {
                Ok(root) if !root.trim().is_empty() => {
                    debug!("using cache root from {ENV_CACHE}");
                    PathBuf::from(root)
                }
                _ => default_cache_root(),
            },
        };

        let ttl = match self.ttl {
            Some(ttl) => ttl,
            None => match env::var(ENV_TTL) {
                Ok(raw) if !raw.trim().is_empty() => parse_duration(&raw)?,
                _ => DEFAULT_TTL,
            },
        };

        let policies = match self.policies {
            Some(policies) if !policies.is_empty() => policies,
            _ => match env::var(ENV_MODE) {
                Ok(raw) if !raw.trim().is_empty() => parse_cache_mode(&raw)?,
                _ => default_cache_policies(),
            },
        };

        let credentials = match self.credentials {
            Some(credentials) => credentials,
            None => match env::var(ENV_CREDENTIALS) {
                Ok(raw) if !raw.trim().is_empty() => credentials::load(&raw)?,
                _ => Vec::new(),
            },
        };

        Ok(Config {
            cache_root,
            ttl,
            policies,
            credentials,
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            retry_count: self.retry_count.unwrap_or(DEFAULT_RETRY_COUNT),
            ssl_retry_count: self.ssl_retry_count.unwrap_or(DEFAULT_SSL_RETRY_COUNT),
            max_redirections: self.max_redirections.unwrap_or(DEFAULT_MAX_REDIRECTIONS),
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            read_timeout: self.read_timeout.unwrap_or(DEFAULT_READ_TIMEOUT),
            request_timeout: self.request_timeout,
            lock_policy: self.lock_policy.unwrap_or_default(),
            checksums: self.checksums.unwrap_or_else(default_checksums),
            strict_conflicts: self.strict_conflicts.unwrap_or(false),
        })
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("quiver")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("30 min").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("3600s").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2d").unwrap(), Duration::from_secs(172_800));
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn mode_tokens() {
        assert_eq!(
            parse_cache_mode("offline").unwrap(),
            vec![CachePolicy::LocalOnly]
        );
        assert_eq!(parse_cache_mode("force").unwrap(), vec![CachePolicy::Update]);
        assert_eq!(
            parse_cache_mode("update-changing").unwrap(),
            vec![CachePolicy::LocalUpdateChanging, CachePolicy::FetchMissing]
        );
        // Comma- and space-separated combinations.
        assert_eq!(
            parse_cache_mode("offline,missing").unwrap(),
            vec![CachePolicy::LocalOnly, CachePolicy::FetchMissing]
        );
        assert_eq!(
            parse_cache_mode("offline missing").unwrap(),
            parse_cache_mode("offline,missing").unwrap()
        );
        assert!(parse_cache_mode("turbo").is_err());
        assert!(parse_cache_mode("  ").is_err());
    }

    #[test]
    fn builder_explicit_values_win() {
        let config = Config::builder()
            .cache_root("/tmp/quiver-test-cache")
            .ttl(Duration::from_secs(60))
            .policies(vec![CachePolicy::LocalOnly])
            .concurrency(2)
            .strict_conflicts(true)
            .build()
            .unwrap();
        assert_eq!(config.cache_root, PathBuf::from("/tmp/quiver-test-cache"));
        assert_eq!(config.ttl, Duration::from_secs(60));
        assert_eq!(config.policies, vec![CachePolicy::LocalOnly]);
        assert_eq!(config.concurrency, 2);
        assert!(config.strict_conflicts);
        assert_eq!(config.retry_count, DEFAULT_RETRY_COUNT);
        assert_eq!(config.ssl_retry_count, DEFAULT_SSL_RETRY_COUNT);
        assert_eq!(config.max_redirections, DEFAULT_MAX_REDIRECTIONS);
    }

    #[test]
    fn concurrency_never_zero() {
        let config = Config::builder()
            .cache_root("/tmp/qc")
            .concurrency(0)
            .build()
            .unwrap();
        assert_eq!(config.concurrency, 1);
    }
}
