// Live DASH recording: manifest polling, chunk scheduling and run reconciliation
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod manifest;
pub mod model;
pub mod mux;
pub mod observer;
pub mod probe;
pub mod reconcile;
pub mod scheduler;
pub mod session;
pub mod source;
pub mod strategy;
pub mod utils;

// Export common types for ease of use
pub use client::{create_client, install_rustls_provider};
pub use config::{
    CountMismatchPolicy, HttpConfig, LiveConfig, LiveConfigBuilder, ObserverConfig,
    ReconcileConfig, SchedulerConfig, ToolConfig,
};
pub use error::{LiveError, Result};
pub use events::ObserverEvent;
pub use fetcher::{ChunkFetcher, HttpChunkFetcher};
pub use manifest::{ExtractedTracks, FormatSelector, MpdExtractor, TrackExtractor};
pub use model::{ChunkRef, OutputArtifact, Run, SessionReport, Task, TaskState, TrackKind};
pub use mux::{FfmpegMuxer, MuxInput, Muxer};
pub use observer::{ManifestObserver, SeenSet};
pub use probe::FfprobeProber;
pub use reconcile::{Reconciler, RunPlan, partition_runs, plan_runs};
pub use scheduler::{SchedulerOutcome, SegmentScheduler};
pub use session::LiveSession;
pub use source::{Availability, HttpManifestSource, LatencyClass, StreamInfo, StreamSource};
pub use strategy::{
    ConcatStrategy, DecisionSource, HeuristicPolicy, LatencyClassHeuristic, ProbeOutcome,
    Prober, StrategyDecision, StrategySelector,
};
