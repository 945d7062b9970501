// quiver-net/src/lib.rs
pub mod auth;
pub mod cache;
pub mod checksum;
pub mod download;
pub mod fetcher;
pub mod lock;

pub use cache::Cache;
pub use download::{Conditional, Downloader, FetchResponse};
pub use fetcher::FileFetcher;
pub use lock::{FileLock, KeyedLocks};
