use std::path::PathBuf;

use reqwest::StatusCode;

use crate::model::TrackKind;

#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("session cancelled")]
    Cancelled,

    #[error("failed to connect to stream: {reason}")]
    Connection { reason: String },

    #[error("manifest fetch failed: {reason}")]
    ManifestFetch { reason: String },

    #[error("manifest parse error: {reason}")]
    ManifestParse { reason: String },

    #[error("{track}#{sequence_id} fetch failed: {reason}")]
    ChunkFetch {
        track: TrackKind,
        sequence_id: u64,
        reason: String,
    },

    #[error("incomplete transfer for {url}: expected {expected} bytes, got {received}")]
    IncompleteTransfer {
        url: String,
        expected: u64,
        received: u64,
    },

    #[error(
        "downloaded video/audio chunk counts differ ({video} video, {audio} audio); \
         temporary files are kept in {}",
        work_dir.display()
    )]
    SequenceMismatch {
        video: usize,
        audio: usize,
        work_dir: PathBuf,
    },

    #[error("muxing failed: {reason}")]
    Mux { reason: String },

    #[error("probe failed: {reason}")]
    Probe { reason: String },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus { status: StatusCode, url: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl LiveError {
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    pub fn manifest_fetch(reason: impl Into<String>) -> Self {
        Self::ManifestFetch {
            reason: reason.into(),
        }
    }

    pub fn manifest_parse(reason: impl Into<String>) -> Self {
        Self::ManifestParse {
            reason: reason.into(),
        }
    }

    pub fn mux(reason: impl Into<String>) -> Self {
        Self::Mux {
            reason: reason.into(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn http_status(status: StatusCode, url: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
        }
    }

    /// Whether the failing layer may try the same operation again.
    ///
    /// Chunk and manifest failures are absorbed by the scheduler and the
    /// observer respectively; only connection loss, count mismatches and
    /// configuration problems reach the operator.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled
            | Self::Connection { .. }
            | Self::SequenceMismatch { .. }
            | Self::Configuration { .. }
            | Self::Mux { .. } => false,
            Self::ManifestFetch { .. }
            | Self::ManifestParse { .. }
            | Self::ChunkFetch { .. }
            | Self::IncompleteTransfer { .. }
            | Self::Probe { .. }
            | Self::HttpStatus { .. }
            | Self::Network { .. }
            | Self::Io { .. }
            | Self::Timeout { .. } => true,
        }
    }

    /// Errors that end the session instead of being logged and skipped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::SequenceMismatch { .. } | Self::Cancelled
        )
    }
}

pub type Result<T> = std::result::Result<T, LiveError>;
