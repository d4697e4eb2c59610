//! Reconciliation: pairs the finished video and audio chunks, splits them
//! into contiguous runs and muxes one output per run.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::{CountMismatchPolicy, ReconcileConfig};
use crate::error::LiveError;
use crate::model::{OutputArtifact, Run, Task, TrackKind, chunk_path};
use crate::mux::{MuxInput, Muxer, concat_files, write_file_list};
use crate::source::StreamInfo;
use crate::strategy::{ConcatStrategy, StrategyDecision, StrategySelector};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RunPlan {
    pub runs: Vec<Run>,
    /// Finished chunks on either track without a counterpart on the other.
    pub orphan_count: usize,
}

/// Splits sorted, de-duplicated ids wherever two neighbours are not consecutive.
pub fn partition_runs(ids: &[u64]) -> Vec<Run> {
    let mut runs = Vec::new();
    let mut current: Vec<u64> = Vec::new();
    for &id in ids {
        if let Some(&prev) = current.last()
            && prev + 1 != id
        {
            runs.push(Run::new(std::mem::take(&mut current)));
        }
        current.push(id);
    }
    if !current.is_empty() {
        runs.push(Run::new(current));
    }
    runs
}

/// Pure planning step of reconciliation.
pub fn plan_runs(
    finished: &[Task],
    config: &ReconcileConfig,
    work_dir: &Path,
) -> Result<RunPlan, LiveError> {
    if finished.is_empty() {
        return Ok(RunPlan::default());
    }

    let ids_of = |kind: TrackKind| -> BTreeSet<u64> {
        finished
            .iter()
            .filter(|t| t.kind == kind)
            .map(|t| t.sequence_id)
            .collect()
    };
    let video = ids_of(TrackKind::Video);
    let audio = ids_of(TrackKind::Audio);

    if video.len() != audio.len() {
        match config.count_mismatch {
            CountMismatchPolicy::Abort => {
                return Err(LiveError::SequenceMismatch {
                    video: video.len(),
                    audio: audio.len(),
                    work_dir: work_dir.to_path_buf(),
                });
            }
            CountMismatchPolicy::MatchById => warn!(
                video = video.len(),
                audio = audio.len(),
                "Finished chunk counts differ, matching by sequence id"
            ),
        }
    }

    let matched: Vec<u64> = video.intersection(&audio).copied().collect();
    let orphan_count = video.len() + audio.len() - 2 * matched.len();
    if orphan_count > 0 {
        warn!(orphans = orphan_count, "Dropping chunks without a counterpart track");
    }

    let mut runs = partition_runs(&matched);
    if runs.len() > 1 && config.force_merge {
        info!(runs = runs.len(), "Force-merging discontinuous runs");
        runs = vec![Run::new(matched)];
    }

    Ok(RunPlan { runs, orphan_count })
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub artifacts: Vec<OutputArtifact>,
    pub orphan_count: usize,
    pub strategy: Option<ConcatStrategy>,
    pub work_dir_retained: bool,
}

pub struct Reconciler {
    muxer: Arc<dyn Muxer>,
    selector: StrategySelector,
    config: ReconcileConfig,
    work_dir: PathBuf,
    output_dir: PathBuf,
    output_stem: String,
    container: String,
}

impl Reconciler {
    pub fn new(
        muxer: Arc<dyn Muxer>,
        selector: StrategySelector,
        config: ReconcileConfig,
        work_dir: PathBuf,
        output_dir: PathBuf,
        output_stem: String,
        container: String,
    ) -> Self {
        Self {
            muxer,
            selector,
            config,
            work_dir,
            output_dir,
            output_stem,
            container,
        }
    }

    fn output_path(&self, index: usize, total: usize) -> PathBuf {
        let name = if total > 1 {
            format!("{}_{}.{}", self.output_stem, index + 1, self.container)
        } else {
            format!("{}.{}", self.output_stem, self.container)
        };
        self.output_dir.join(name)
    }

    fn chunk_files(&self, kind: TrackKind, run: &Run) -> Vec<PathBuf> {
        run.ids()
            .iter()
            .map(|&id| chunk_path(&self.work_dir, kind, id))
            .collect()
    }

    pub async fn reconcile(
        &self,
        finished: &[Task],
        info: &StreamInfo,
    ) -> Result<ReconcileReport, LiveError> {
        if finished.is_empty() {
            warn!("No chunk was downloaded, nothing to reconcile");
            return Ok(ReconcileReport {
                work_dir_retained: self.cleanup(self.config.keep_temporary_files).await,
                ..Default::default()
            });
        }

        let plan = plan_runs(finished, &self.config, &self.work_dir)?;
        if plan.runs.len() > 1 {
            for (i, run) in plan.runs.iter().enumerate() {
                info!(index = i + 1, range = %run.describe(), chunks = run.len(), "Run");
            }
        }

        let mut report = ReconcileReport {
            orphan_count: plan.orphan_count,
            ..Default::default()
        };
        let Some(sample) = plan
            .runs
            .iter()
            .find(|r| r.len() >= 2)
            .or_else(|| plan.runs.iter().find(|r| !r.is_empty()))
        else {
            report.work_dir_retained = self.cleanup(self.config.keep_temporary_files).await;
            return Ok(report);
        };

        let decision = self
            .selector
            .decide(&self.chunk_files(TrackKind::Video, sample), info)
            .await;
        report.strategy = Some(decision.strategy);

        let mut failures = 0;
        let total = plan.runs.len();
        for (index, run) in plan.runs.iter().enumerate() {
            let output = self.output_path(index, total);
            match self.assemble(index, run, &decision, &output).await {
                Ok(path) => {
                    info!(range = %run.describe(), path = %path.display(), "Output written");
                    report.artifacts.push(OutputArtifact {
                        description: run.describe(),
                        path,
                    });
                }
                Err(e) => {
                    failures += 1;
                    error!(range = %run.describe(), error = %e, "Failed to assemble run, skipping");
                }
            }
        }

        let keep = self.config.keep_temporary_files || decision.requires_retention() || failures > 0;
        report.work_dir_retained = self.cleanup(keep).await;
        Ok(report)
    }

    async fn assemble(
        &self,
        index: usize,
        run: &Run,
        decision: &StrategyDecision,
        output: &Path,
    ) -> Result<PathBuf, LiveError> {
        let video = self.chunk_files(TrackKind::Video, run);
        let audio = self.chunk_files(TrackKind::Audio, run);

        let (video_input, audio_input) = match decision.strategy {
            ConcatStrategy::DirectConcat => {
                let video_out = self.work_dir.join(format!("video_merge_{index}"));
                let audio_out = self.work_dir.join(format!("audio_merge_{index}"));
                concat_files(&video, &video_out).await?;
                concat_files(&audio, &audio_out).await?;
                (MuxInput::File(video_out), MuxInput::File(audio_out))
            }
            ConcatStrategy::ToolConcat => {
                let video_list = self.work_dir.join(format!("video_files_{index}.txt"));
                let audio_list = self.work_dir.join(format!("audio_files_{index}.txt"));
                write_file_list(&video, &video_list).await?;
                write_file_list(&audio, &audio_list).await?;
                (MuxInput::FileList(video_list), MuxInput::FileList(audio_list))
            }
        };

        self.muxer.mux(&video_input, &audio_input, output).await
    }

    /// Removes the working directory unless `keep`; returns whether it is still there.
    async fn cleanup(&self, keep: bool) -> bool {
        if keep {
            info!(path = %self.work_dir.display(), "Keeping temporary files");
            return true;
        }
        match tokio::fs::remove_dir_all(&self.work_dir).await {
            Ok(()) => false,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => {
                warn!(path = %self.work_dir.display(), error = %e, "Failed to remove temporary files");
                true
            }
        }
    }
}
