//! Shared chunk, task and run types.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::strategy::ConcatStrategy;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    #[default]
    Video,
    Audio,
}

impl TrackKind {
    pub const ALL: [TrackKind; 2] = [TrackKind::Video, TrackKind::Audio];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
        }
    }

    /// Name of the per-track raw chunk directory inside a working directory.
    pub fn download_dir(&self) -> &'static str {
        match self {
            Self::Video => "video_download",
            Self::Audio => "audio_download",
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One addressable chunk as listed by the manifest.
///
/// Identity is `(kind, sequence_id)`; the url may change between polls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRef {
    pub kind: TrackKind,
    pub sequence_id: u64,
    pub url: String,
}

impl ChunkRef {
    pub fn new(kind: TrackKind, sequence_id: u64, url: impl Into<String>) -> Self {
        Self {
            kind,
            sequence_id,
            url: url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Done,
    Dropped,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub kind: TrackKind,
    pub sequence_id: u64,
    pub url: String,
    pub retry_count: u32,
    pub output_path: PathBuf,
    pub state: TaskState,
}

impl Task {
    /// Creates a pending task that stores its chunk as `<work_dir>/<track>_download/<id>`.
    pub fn from_chunk(chunk: ChunkRef, work_dir: &Path) -> Self {
        let output_path = chunk_path(work_dir, chunk.kind, chunk.sequence_id);
        Self {
            kind: chunk.kind,
            sequence_id: chunk.sequence_id,
            url: chunk.url,
            retry_count: 0,
            output_path,
            state: TaskState::Pending,
        }
    }

    pub fn label(&self) -> String {
        format!("{}#{}", self.kind, self.sequence_id)
    }
}

pub fn chunk_path(work_dir: &Path, kind: TrackKind, sequence_id: u64) -> PathBuf {
    work_dir
        .join(kind.download_dir())
        .join(sequence_id.to_string())
}

/// A maximal group of consecutive sequence ids present on both tracks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
    ids: Vec<u64>,
}

impl Run {
    pub fn new(ids: Vec<u64>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[u64] {
        &self.ids
    }

    pub fn first(&self) -> Option<u64> {
        self.ids.first().copied()
    }

    pub fn last(&self) -> Option<u64> {
        self.ids.last().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn describe(&self) -> String {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => format!("#{first} - #{last}"),
            _ => "#empty".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputArtifact {
    pub description: String,
    pub path: PathBuf,
}

/// Final result of one download session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub artifacts: Vec<OutputArtifact>,
    pub dropped_chunk_count: usize,
    pub orphan_chunk_count: usize,
    pub work_dir: PathBuf,
    pub work_dir_retained: bool,
    pub strategy: Option<ConcatStrategy>,
}
