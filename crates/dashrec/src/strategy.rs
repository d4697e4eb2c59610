//! Choosing how chunk files are joined.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::source::{LatencyClass, StreamInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcatStrategy {
    /// Chunks continue each other's timeline and are joined byte by byte.
    DirectConcat,
    /// Chunks restart at timestamp zero and go through the muxer's concat demuxer.
    ToolConcat,
}

impl fmt::Display for ConcatStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectConcat => f.write_str("direct"),
            Self::ToolConcat => f.write_str("tool"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbeOutcome {
    /// Timestamp of the first packet, in stream time base units.
    FirstPacketPts(i64),
    Unknown,
}

/// Inspects a chunk file with an external tool.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn is_available(&self) -> bool;

    /// Never fails: any problem is reported as [`ProbeOutcome::Unknown`].
    async fn probe(&self, path: &Path) -> ProbeOutcome;
}

/// Fallback used when probing is impossible.
pub trait HeuristicPolicy: Send + Sync {
    fn guess(&self, info: &StreamInfo) -> ConcatStrategy;
}

/// Premieres and ordinary-latency streams restart timestamps per chunk;
/// low-latency streams do not.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyClassHeuristic;

impl HeuristicPolicy for LatencyClassHeuristic {
    fn guess(&self, info: &StreamInfo) -> ConcatStrategy {
        if info.is_premiere {
            return ConcatStrategy::ToolConcat;
        }
        match info.latency_class {
            LatencyClass::Normal => ConcatStrategy::ToolConcat,
            LatencyClass::Low | LatencyClass::UltraLow => ConcatStrategy::DirectConcat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Override,
    SingleChunk,
    Probe,
    Heuristic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrategyDecision {
    pub strategy: ConcatStrategy,
    pub source: DecisionSource,
}

impl StrategyDecision {
    /// A guessed strategy may be wrong, so the raw chunks must survive cleanup.
    pub fn requires_retention(&self) -> bool {
        self.source == DecisionSource::Heuristic
    }
}

pub struct StrategySelector {
    concat_override: Option<ConcatStrategy>,
    prober: Arc<dyn Prober>,
    heuristic: Arc<dyn HeuristicPolicy>,
}

impl StrategySelector {
    pub fn new(
        concat_override: Option<ConcatStrategy>,
        prober: Arc<dyn Prober>,
        heuristic: Arc<dyn HeuristicPolicy>,
    ) -> Self {
        Self {
            concat_override,
            prober,
            heuristic,
        }
    }

    /// `chunks` are the ordered chunk files of one track of a run.
    pub async fn decide(&self, chunks: &[PathBuf], info: &StreamInfo) -> StrategyDecision {
        if let Some(strategy) = self.concat_override {
            return StrategyDecision {
                strategy,
                source: DecisionSource::Override,
            };
        }

        let Some(second) = chunks.get(1) else {
            return StrategyDecision {
                strategy: ConcatStrategy::DirectConcat,
                source: DecisionSource::SingleChunk,
            };
        };

        match self.prober.probe(second).await {
            ProbeOutcome::FirstPacketPts(pts) => {
                let strategy = if pts == 0 {
                    ConcatStrategy::ToolConcat
                } else {
                    ConcatStrategy::DirectConcat
                };
                info!(pts, %strategy, "Concat strategy chosen by probe");
                StrategyDecision {
                    strategy,
                    source: DecisionSource::Probe,
                }
            }
            ProbeOutcome::Unknown => {
                let strategy = self.heuristic.guess(info);
                warn!(
                    %strategy,
                    premiere = info.is_premiere,
                    latency = ?info.latency_class,
                    "Probe inconclusive, guessing concat strategy; temporary files will be kept"
                );
                StrategyDecision {
                    strategy,
                    source: DecisionSource::Heuristic,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct FixedProber {
        outcome: ProbeOutcome,
        calls: AtomicUsize,
    }

    impl FixedProber {
        fn new(outcome: ProbeOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Prober for FixedProber {
        async fn is_available(&self) -> bool {
            true
        }

        async fn probe(&self, _path: &Path) -> ProbeOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
        }
    }

    fn selector(concat_override: Option<ConcatStrategy>, prober: Arc<FixedProber>) -> StrategySelector {
        StrategySelector::new(concat_override, prober, Arc::new(LatencyClassHeuristic))
    }

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/w/video_download/{i}"))).collect()
    }

    #[tokio::test]
    async fn override_always_wins() {
        let prober = FixedProber::new(ProbeOutcome::FirstPacketPts(0));
        let decision = selector(Some(ConcatStrategy::DirectConcat), Arc::clone(&prober))
            .decide(&paths(5), &StreamInfo::new("u"))
            .await;
        assert_eq!(decision.strategy, ConcatStrategy::DirectConcat);
        assert_eq!(decision.source, DecisionSource::Override);
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_chunk_needs_no_probe() {
        let prober = FixedProber::new(ProbeOutcome::FirstPacketPts(0));
        let decision = selector(None, Arc::clone(&prober))
            .decide(&paths(1), &StreamInfo::new("u"))
            .await;
        assert_eq!(decision.strategy, ConcatStrategy::DirectConcat);
        assert!(!decision.requires_retention());
        assert_eq!(prober.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zero_pts_on_second_chunk_means_tool_concat() {
        let zero = selector(None, FixedProber::new(ProbeOutcome::FirstPacketPts(0)));
        let info = StreamInfo::new("u");
        assert_eq!(
            zero.decide(&paths(2), &info).await.strategy,
            ConcatStrategy::ToolConcat
        );

        let continued = selector(None, FixedProber::new(ProbeOutcome::FirstPacketPts(90_000)));
        let decision = continued.decide(&paths(2), &info).await;
        assert_eq!(decision.strategy, ConcatStrategy::DirectConcat);
        assert_eq!(decision.source, DecisionSource::Probe);
    }

    #[tokio::test]
    async fn decision_is_idempotent() {
        let selector = selector(None, FixedProber::new(ProbeOutcome::FirstPacketPts(4_000)));
        let info = StreamInfo::new("u");
        let first = selector.decide(&paths(3), &info).await;
        let second = selector.decide(&paths(3), &info).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unknown_probe_falls_back_to_heuristic_and_retains() {
        let selector = selector(None, FixedProber::new(ProbeOutcome::Unknown));
        let mut info = StreamInfo::new("u");

        let decision = selector.decide(&paths(2), &info).await;
        assert_eq!(decision.strategy, ConcatStrategy::ToolConcat);
        assert!(decision.requires_retention());

        info.latency_class = LatencyClass::UltraLow;
        assert_eq!(
            selector.decide(&paths(2), &info).await.strategy,
            ConcatStrategy::DirectConcat
        );

        info.is_premiere = true;
        assert_eq!(
            selector.decide(&paths(2), &info).await.strategy,
            ConcatStrategy::ToolConcat
        );
    }
}
