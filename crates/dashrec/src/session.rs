//! One download session: observer, scheduler and reconciler wired together.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::fetcher::ChunkFetcher;
use crate::manifest::TrackExtractor;
use crate::model::{SessionReport, TrackKind};
use crate::mux::Muxer;
use crate::observer::ManifestObserver;
use crate::reconcile::Reconciler;
use crate::scheduler::SegmentScheduler;
use crate::source::{StreamInfo, StreamSource};
use crate::strategy::{HeuristicPolicy, LatencyClassHeuristic, Prober, StrategySelector};
use crate::utils::sanitize_filename;

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct LiveSession {
    source: Arc<dyn StreamSource>,
    extractor: Arc<dyn TrackExtractor>,
    fetcher: Arc<dyn ChunkFetcher>,
    muxer: Arc<dyn Muxer>,
    prober: Arc<dyn Prober>,
    heuristic: Arc<dyn HeuristicPolicy>,
    config: LiveConfig,
}

impl LiveSession {
    pub fn new(
        source: Arc<dyn StreamSource>,
        extractor: Arc<dyn TrackExtractor>,
        fetcher: Arc<dyn ChunkFetcher>,
        muxer: Arc<dyn Muxer>,
        prober: Arc<dyn Prober>,
        config: LiveConfig,
    ) -> Self {
        Self {
            source,
            extractor,
            fetcher,
            muxer,
            prober,
            heuristic: Arc::new(LatencyClassHeuristic),
            config,
        }
    }

    pub fn with_heuristic(mut self, heuristic: Arc<dyn HeuristicPolicy>) -> Self {
        self.heuristic = heuristic;
        self
    }

    /// Records the stream until it ends or `interrupts` fires, then
    /// reconciles what was downloaded.
    ///
    /// The first interrupt stops polling and lets queued and in-flight chunks
    /// finish. A second one aborts immediately with [`LiveError::Cancelled`],
    /// skipping reconciliation and leaving the working directory in place.
    pub async fn run(self, mut interrupts: mpsc::Receiver<()>) -> Result<SessionReport, LiveError> {
        let work_dir = self.create_work_dir().await?;
        info!(path = %work_dir.display(), "Working directory created");
        self.check_tools().await;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let mut observer = ManifestObserver::new(
            Arc::clone(&self.source),
            Arc::clone(&self.extractor),
            self.config.observer.clone(),
        );

        let connected = tokio::select! {
            result = observer.connect(events_tx) => result,
            Some(()) = interrupts.recv() => {
                info!("Interrupted before the stream went live");
                Err(LiveError::Cancelled)
            }
        };
        let info = match connected {
            Ok(info) => info,
            Err(e) => {
                observer.disconnect();
                let _ = tokio::fs::remove_dir_all(&work_dir).await;
                return Err(e);
            }
        };

        let stop = CancellationToken::new();
        let scheduler = SegmentScheduler::new(
            Arc::clone(&self.fetcher),
            self.config.scheduler.clone(),
            work_dir.clone(),
        );
        let drained = scheduler.run(events_rx, stop.clone());
        tokio::pin!(drained);

        let mut interrupts_open = true;
        let mut interrupted = false;
        let outcome = loop {
            tokio::select! {
                outcome = &mut drained => break outcome,
                signal = interrupts.recv(), if interrupts_open => match signal {
                    Some(()) if !interrupted => {
                        interrupted = true;
                        info!("Interrupt received, finishing downloads. Interrupt again to abort.");
                        observer.disconnect();
                        stop.cancel();
                    }
                    Some(()) => {
                        warn!(path = %work_dir.display(), "Second interrupt, aborting without reconciliation");
                        observer.disconnect();
                        return Err(LiveError::Cancelled);
                    }
                    None => interrupts_open = false,
                },
            }
        };
        observer.disconnect();
        observer.join().await;

        if !outcome.dropped.is_empty() {
            let dropped: Vec<String> = outcome.dropped.iter().map(|t| t.label()).collect();
            warn!(count = dropped.len(), chunks = ?dropped, "Some chunks could not be downloaded");
        }

        let reconciler = self.reconciler(&info, work_dir.clone()).await;
        let report = reconciler.reconcile(&outcome.finished, &info).await.inspect_err(|e| {
            error!(error = %e, "Reconciliation failed");
        })?;

        Ok(SessionReport {
            artifacts: report.artifacts,
            dropped_chunk_count: outcome.dropped.len(),
            orphan_chunk_count: report.orphan_count,
            work_dir,
            work_dir_retained: report.work_dir_retained,
            strategy: report.strategy,
        })
    }

    async fn create_work_dir(&self) -> Result<PathBuf, LiveError> {
        let millis = chrono::Utc::now().timestamp_millis();
        let work_dir = self.config.output_dir.join(format!("dashrec_{millis}"));
        for kind in TrackKind::ALL {
            tokio::fs::create_dir_all(work_dir.join(kind.download_dir())).await?;
        }
        Ok(work_dir)
    }

    async fn check_tools(&self) {
        if !self.muxer.is_available().await {
            warn!(
                ffmpeg = %self.config.tools.ffmpeg_path,
                "Muxer not found; outputs cannot be assembled and temporary files will be kept"
            );
        }
    }

    async fn reconciler(&self, info: &StreamInfo, work_dir: PathBuf) -> Reconciler {
        let mut reconcile = self.config.reconcile.clone();
        if reconcile.concat_override.is_none() && !self.prober.is_available().await {
            warn!(
                ffprobe = %self.config.tools.ffprobe_path,
                "Prober not found; temporary files will be kept"
            );
            reconcile.keep_temporary_files = true;
        }

        let selector = StrategySelector::new(
            reconcile.concat_override,
            Arc::clone(&self.prober),
            Arc::clone(&self.heuristic),
        );
        Reconciler::new(
            Arc::clone(&self.muxer),
            selector,
            reconcile,
            work_dir,
            self.config.output_dir.clone(),
            sanitize_filename(&info.title),
            self.config.container.clone(),
        )
    }
}
