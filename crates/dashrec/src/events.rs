use crate::model::{ChunkRef, TrackKind};

/// Notifications sent from the manifest observer to the scheduler.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// Chunks of one track that no earlier poll surfaced.
    NewChunks {
        kind: TrackKind,
        chunks: Vec<ChunkRef>,
    },
    /// The manifest turned static; sent at most once.
    StreamEnded,
}
