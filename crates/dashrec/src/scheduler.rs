// Segment scheduler: bounded-concurrency chunk downloads with retry.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SchedulerConfig;
use crate::error::LiveError;
use crate::events::ObserverEvent;
use crate::fetcher::ChunkFetcher;
use crate::model::{ChunkRef, Task, TaskState};

/// Everything the scheduler produced, handed over once it has drained.
#[derive(Debug, Default)]
pub struct SchedulerOutcome {
    pub finished: Vec<Task>,
    pub dropped: Vec<Task>,
}

pub struct SegmentScheduler {
    fetcher: Arc<dyn ChunkFetcher>,
    config: SchedulerConfig,
    work_dir: PathBuf,
    queue: VecDeque<Task>,
    finished: Vec<Task>,
    dropped: Vec<Task>,
}

impl SegmentScheduler {
    pub fn new(fetcher: Arc<dyn ChunkFetcher>, config: SchedulerConfig, work_dir: PathBuf) -> Self {
        Self {
            fetcher,
            config,
            work_dir,
            queue: VecDeque::new(),
            finished: Vec::new(),
            dropped: Vec::new(),
        }
    }

    pub fn enqueue(&mut self, chunks: Vec<ChunkRef>) {
        for chunk in chunks {
            let task = Task::from_chunk(chunk, &self.work_dir);
            trace!(task = %task.label(), "Task queued");
            self.queue.push_back(task);
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Consumes observer events until a stop is requested (stream end,
    /// closed channel or `stop`), then drains the queue and every in-flight
    /// fetch before returning.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<ObserverEvent>,
        stop: CancellationToken,
    ) -> SchedulerOutcome {
        info!(max_workers = self.config.max_workers, "SegmentScheduler started.");
        let mut in_flight = FuturesUnordered::new();
        let mut stop_requested = false;

        loop {
            while in_flight.len() < self.config.max_workers.max(1)
                && let Some(mut task) = self.queue.pop_front()
            {
                task.state = TaskState::Running;
                let timeout = self.config.fetch_timeout(task.retry_count);
                trace!(task = %task.label(), retry = task.retry_count, ?timeout, "Dispatching");
                in_flight.push(Self::perform_fetch(
                    Arc::clone(&self.fetcher),
                    task,
                    timeout,
                    self.config.cooldown,
                ));
            }

            if stop_requested && in_flight.is_empty() && self.queue.is_empty() {
                break;
            }

            tokio::select! {
                biased;

                _ = stop.cancelled(), if !stop_requested => {
                    info!(
                        in_flight = in_flight.len(),
                        queued = self.queue.len(),
                        "Stop requested, draining remaining tasks"
                    );
                    stop_requested = true;
                    // Chunks the observer already announced still count as queued.
                    events.close();
                    while let Ok(event) = events.try_recv() {
                        if let ObserverEvent::NewChunks { chunks, .. } = event {
                            self.enqueue(chunks);
                        }
                    }
                }

                event = events.recv(), if !stop_requested => match event {
                    Some(ObserverEvent::NewChunks { kind, chunks }) => {
                        debug!(track = %kind, count = chunks.len(), "Enqueueing new chunks");
                        self.enqueue(chunks);
                    }
                    Some(ObserverEvent::StreamEnded) => {
                        info!("Stream ended, draining remaining tasks");
                        stop_requested = true;
                    }
                    None => {
                        debug!("Observer channel closed, draining remaining tasks");
                        stop_requested = true;
                    }
                },

                Some((task, result)) = in_flight.next() => self.complete(task, result),

                else => stop_requested = true,
            }
        }

        info!(
            finished = self.finished.len(),
            dropped = self.dropped.len(),
            "SegmentScheduler drained."
        );
        SchedulerOutcome {
            finished: self.finished,
            dropped: self.dropped,
        }
    }

    fn complete(&mut self, mut task: Task, result: Result<(), LiveError>) {
        match result {
            Ok(()) => {
                task.state = TaskState::Done;
                debug!(task = %task.label(), "Chunk downloaded");
                self.finished.push(task);
            }
            Err(e) => {
                task.retry_count += 1;
                if !e.is_retryable() || task.retry_count > self.config.max_retries {
                    task.state = TaskState::Dropped;
                    warn!(
                        task = %task.label(),
                        attempts = task.retry_count,
                        error = %e,
                        "Chunk dropped after exhausting retries"
                    );
                    self.dropped.push(task);
                } else {
                    task.state = TaskState::Pending;
                    debug!(task = %task.label(), retry = task.retry_count, error = %e, "Chunk fetch failed, requeueing");
                    self.queue.push_back(task);
                }
            }
        }
    }

    async fn perform_fetch(
        fetcher: Arc<dyn ChunkFetcher>,
        task: Task,
        timeout: Duration,
        cooldown: Option<Duration>,
    ) -> (Task, Result<(), LiveError>) {
        let result = match tokio::time::timeout(
            timeout,
            fetcher.fetch(&task.url, &task.output_path, timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LiveError::timeout(format!("exceeded {timeout:?}"))),
        }
        .map_err(|e| {
            if e.is_retryable() {
                LiveError::ChunkFetch {
                    track: task.kind,
                    sequence_id: task.sequence_id,
                    reason: e.to_string(),
                }
            } else {
                e
            }
        });

        if result.is_ok()
            && let Some(cooldown) = cooldown
        {
            tokio::time::sleep(cooldown).await;
        }
        (task, result)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::model::TrackKind;

    #[derive(Default)]
    struct FlakyFetcher {
        /// url -> remaining failures
        failures: Mutex<HashMap<String, u32>>,
        timeouts: Mutex<HashMap<String, Vec<Duration>>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl FlakyFetcher {
        fn failing(url: &str, times: u32) -> Self {
            let fetcher = Self::default();
            fetcher.failures.lock().unwrap().insert(url.to_string(), times);
            fetcher
        }
    }

    #[async_trait]
    impl ChunkFetcher for FlakyFetcher {
        async fn fetch(&self, url: &str, _dest: &Path, timeout: Duration) -> Result<(), LiveError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.timeouts
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push(timeout);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut failures = self.failures.lock().unwrap();
            match failures.get_mut(url) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    Err(LiveError::manifest_fetch("injected"))
                }
                _ => Ok(()),
            }
        }
    }

    fn chunks(kind: TrackKind, ids: std::ops::Range<u64>) -> Vec<ChunkRef> {
        ids.map(|i| ChunkRef::new(kind, i, format!("{kind}/{i}"))).collect()
    }

    fn scheduler(fetcher: Arc<FlakyFetcher>, max_workers: usize) -> SegmentScheduler {
        let config = SchedulerConfig {
            max_workers,
            ..SchedulerConfig::default()
        };
        SegmentScheduler::new(fetcher, config, PathBuf::from("/work"))
    }

    async fn run_to_end(
        scheduler: SegmentScheduler,
        batches: Vec<Vec<ChunkRef>>,
    ) -> SchedulerOutcome {
        let (tx, rx) = mpsc::channel(16);
        for chunks in batches {
            let kind = chunks[0].kind;
            tx.send(ObserverEvent::NewChunks { kind, chunks }).await.unwrap();
        }
        tx.send(ObserverEvent::StreamEnded).await.unwrap();
        scheduler.run(rx, CancellationToken::new()).await
    }

    #[tokio::test(start_paused = true)]
    async fn respects_worker_budget() {
        let fetcher = Arc::new(FlakyFetcher::default());
        let outcome = run_to_end(
            scheduler(Arc::clone(&fetcher), 3),
            vec![chunks(TrackKind::Video, 0..8), chunks(TrackKind::Audio, 0..8)],
        )
        .await;

        assert_eq!(outcome.finished.len(), 16);
        assert!(outcome.dropped.is_empty());
        assert!(outcome.finished.iter().all(|t| t.state == TaskState::Done));
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn drops_after_eleven_failures_with_growing_timeouts() {
        let fetcher = Arc::new(FlakyFetcher::failing("video/5", u32::MAX));
        let outcome = run_to_end(
            scheduler(Arc::clone(&fetcher), 4),
            vec![chunks(TrackKind::Video, 0..8)],
        )
        .await;

        assert_eq!(outcome.finished.len(), 7);
        assert_eq!(outcome.dropped.len(), 1);
        let dropped = &outcome.dropped[0];
        assert_eq!(dropped.sequence_id, 5);
        assert_eq!(dropped.retry_count, 11);
        assert_eq!(dropped.state, TaskState::Dropped);

        let seen = fetcher.timeouts.lock().unwrap()["video/5"].clone();
        assert_eq!(seen.len(), 11);
        assert_eq!(seen[0], Duration::from_secs(15));
        assert_eq!(seen[1], Duration::from_secs(30));
        assert!(seen[2..].iter().all(|t| *t == Duration::from_secs(45)));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_within_budget() {
        let fetcher = Arc::new(FlakyFetcher::failing("audio/2", 10));
        let outcome = run_to_end(scheduler(fetcher, 2), vec![chunks(TrackKind::Audio, 0..4)]).await;

        assert!(outcome.dropped.is_empty());
        let recovered = outcome
            .finished
            .iter()
            .find(|t| t.sequence_id == 2)
            .unwrap();
        assert_eq!(recovered.retry_count, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_drains_queued_and_in_flight_tasks() {
        let fetcher = Arc::new(FlakyFetcher::default());
        let mut scheduler = scheduler(Arc::clone(&fetcher), 3);
        scheduler.enqueue(chunks(TrackKind::Video, 0..5));
        assert_eq!(scheduler.queued(), 5);

        let (_tx, rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        stop.cancel();
        let outcome = scheduler.run(rx, stop).await;

        assert_eq!(outcome.finished.len(), 5);
        assert_eq!(fetcher.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_pauses_after_each_success() {
        let fetcher = Arc::new(FlakyFetcher::default());
        let config = SchedulerConfig {
            max_workers: 1,
            cooldown: Some(Duration::from_secs(2)),
            ..SchedulerConfig::default()
        };
        let scheduler = SegmentScheduler::new(fetcher, config, PathBuf::from("/work"));

        let started = tokio::time::Instant::now();
        let outcome = run_to_end(scheduler, vec![chunks(TrackKind::Video, 0..3)]).await;

        assert_eq!(outcome.finished.len(), 3);
        // 3 x (10ms fetch + 2s cooldown) on a single worker
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(6030), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(7), "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_reported_with_chunk_identity() {
        let fetcher: Arc<dyn ChunkFetcher> = Arc::new(FlakyFetcher::failing("audio/9", 1));
        let task = Task::from_chunk(
            ChunkRef::new(TrackKind::Audio, 9, "audio/9"),
            Path::new("/work"),
        );
        let (task, result) =
            SegmentScheduler::perform_fetch(fetcher, task, Duration::from_secs(15), None).await;

        assert_eq!(task.sequence_id, 9);
        match result {
            Err(LiveError::ChunkFetch {
                track,
                sequence_id,
                reason,
            }) => {
                assert_eq!(track, TrackKind::Audio);
                assert_eq!(sequence_id, 9);
                assert!(reason.contains("injected"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_drops_immediately() {
        struct Misconfigured;

        #[async_trait]
        impl ChunkFetcher for Misconfigured {
            async fn fetch(&self, _url: &str, _dest: &Path, _t: Duration) -> Result<(), LiveError> {
                Err(LiveError::configuration("no client"))
            }
        }

        let scheduler =
            SegmentScheduler::new(Arc::new(Misconfigured), SchedulerConfig::default(), PathBuf::from("/w"));
        let outcome = run_to_end(scheduler, vec![chunks(TrackKind::Video, 0..2)]).await;

        assert!(outcome.finished.is_empty());
        assert_eq!(outcome.dropped.len(), 2);
        assert!(outcome.dropped.iter().all(|t| t.retry_count == 1));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_timeout_counts_as_failure() {
        struct Hanging;

        #[async_trait]
        impl ChunkFetcher for Hanging {
            async fn fetch(&self, _url: &str, _dest: &Path, _t: Duration) -> Result<(), LiveError> {
                std::future::pending().await
            }
        }

        let config = SchedulerConfig {
            max_retries: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = SegmentScheduler::new(Arc::new(Hanging), config, PathBuf::from("/w"));
        let (tx, rx) = mpsc::channel(4);
        tx.send(ObserverEvent::NewChunks {
            kind: TrackKind::Video,
            chunks: chunks(TrackKind::Video, 0..1),
        })
        .await
        .unwrap();
        drop(tx);

        let outcome = scheduler.run(rx, CancellationToken::new()).await;
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].retry_count, 2);
    }
}
