//! Manifest snapshot → per-track chunk lists.

mod format;
mod mpd;

pub use format::FormatSelector;
pub use mpd::MpdExtractor;

use crate::error::LiveError;
use crate::model::{ChunkRef, TrackKind};

/// Result of extracting one manifest snapshot.
#[derive(Debug, Clone, Default)]
pub struct ExtractedTracks {
    /// Chunks of the selected video representation, in manifest order.
    pub video: Vec<ChunkRef>,
    /// Chunks of the selected audio representation, in manifest order.
    pub audio: Vec<ChunkRef>,
    /// The manifest describes a finished (static) presentation.
    pub is_final: bool,
}

impl ExtractedTracks {
    pub fn track(&self, kind: TrackKind) -> &[ChunkRef] {
        match kind {
            TrackKind::Video => &self.video,
            TrackKind::Audio => &self.audio,
        }
    }
}

pub trait TrackExtractor: Send + Sync {
    fn extract(&self, manifest: &[u8]) -> Result<ExtractedTracks, LiveError>;
}
