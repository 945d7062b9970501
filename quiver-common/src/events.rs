// quiver-common/src/events.rs
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::QuiverError;

/// Progress hooks for the embedding UI layer. The core only ever emits
/// these; it never owns a progress display itself. Events are broadcast;
/// a lagging or absent subscriber never blocks a fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FetchEvent {
    ResolutionStarted {
        root_count: usize,
    },
    DescriptorBatch {
        pending: usize,
    },
    ResolutionFinished {
        node_count: usize,
        conflict_count: usize,
    },
    DownloadStarted {
        url: String,
    },
    DownloadProgress {
        url: String,
        bytes: u64,
        total: Option<u64>,
    },
    DownloadFinished {
        url: String,
        path: PathBuf,
        size_bytes: u64,
    },
    DownloadFailed {
        url: String,
        // Events carry strings so they stay cheap to clone and serialize.
        error: String,
    },
    /// The local copy was fresh enough; no network traffic happened.
    CacheHit {
        url: String,
        path: PathBuf,
    },
}

impl FetchEvent {
    pub fn download_failed(url: impl Into<String>, error: &QuiverError) -> Self {
        FetchEvent::DownloadFailed {
            url: url.into(),
            error: error.to_string(),
        }
    }
}

/// Sender half the orchestrator and fetcher hold. Sends are fire-and-forget
/// (`let _ = tx.send(..)`); a channel with no subscribers is fine.
pub type EventSender = tokio::sync::broadcast::Sender<FetchEvent>;

pub const EVENT_CHANNEL_SIZE: usize = 100;

/// A sender nobody listens to, for callers that do not care.
pub fn null_sender() -> EventSender {
    tokio::sync::broadcast::channel(EVENT_CHANNEL_SIZE).0
}
