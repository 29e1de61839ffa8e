//! Unified error types for pixcache.
//!
//! Every variant renders with a stable upper-case code prefix so log lines
//! and CLI output can be grepped without matching on free text.

use std::io;

/// Unified error types for the cache tiers and the fetch pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Disk cache key does not match `[a-z0-9_-]{1,120}`.
    #[error("INVALID_KEY: {0}")]
    InvalidKey(String),

    /// An editor is already open for this key.
    #[error("EDIT_CONFLICT: {0}")]
    EditConflict(String),

    /// Snapshot no longer matches the entry's latest committed version.
    #[error("STALE_SNAPSHOT: {0}")]
    StaleSnapshot(String),

    /// A newly created entry was committed without a value for some index.
    #[error("MISSING_VALUE: entry {key} has no value for index {index}")]
    MissingValue { key: String, index: usize },

    /// Filesystem operation failed.
    #[error("IO_ERROR: {0}")]
    Io(#[from] io::Error),

    /// Journal header or body could not be parsed.
    #[error("JOURNAL_CORRUPT: {0}")]
    JournalCorrupt(String),

    /// Operation attempted on a closed disk cache.
    #[error("CACHE_CLOSED")]
    Closed,

    /// Invalid construction parameter.
    #[error("INVALID_CONFIG: {0}")]
    InvalidConfig(String),

    /// Identifier is not a fetchable URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Connect or read timeout while fetching.
    #[error("FETCH_TIMEOUT: {0}")]
    FetchTimeout(String),

    /// Response body exceeded the configured limit.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),

    /// Transport failure or non-success status.
    #[error("HTTP_ERROR: {0}")]
    HttpError(String),

    /// Payload could not be decoded or re-encoded by the codec.
    #[error("DECODE_FAILED: {0}")]
    DecodeFailed(String),
}

impl Error {
    /// True for failures of the network-fetch tier.
    pub fn is_fetch_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidUrl(_) | Error::FetchTimeout(_) | Error::FetchTooLarge(_) | Error::HttpError(_)
        )
    }
}
