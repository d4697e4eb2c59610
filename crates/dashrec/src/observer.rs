//! Manifest polling: turns a growing remote manifest into batches of
//! never-before-seen chunks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::ObserverConfig;
use crate::error::LiveError;
use crate::events::ObserverEvent;
use crate::manifest::TrackExtractor;
use crate::model::{ChunkRef, TrackKind};
use crate::source::{Availability, LatencyClass, StreamInfo, StreamSource};

/// Sequence ids already surfaced, per track.
#[derive(Debug, Default)]
pub struct SeenSet {
    video: BTreeSet<u64>,
    audio: BTreeSet<u64>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn track_mut(&mut self, kind: TrackKind) -> &mut BTreeSet<u64> {
        match kind {
            TrackKind::Video => &mut self.video,
            TrackKind::Audio => &mut self.audio,
        }
    }

    /// Marks every chunk as seen and returns the ones that were not seen before.
    pub fn mark_new(&mut self, kind: TrackKind, chunks: &[ChunkRef]) -> Vec<ChunkRef> {
        let seen = self.track_mut(kind);
        chunks
            .iter()
            .filter(|c| seen.insert(c.sequence_id))
            .cloned()
            .collect()
    }
}

/// Poll cadence for a stream with the given latency characteristics.
pub fn poll_interval(config: &ObserverConfig, info: &StreamInfo) -> Duration {
    match info.latency_class {
        LatencyClass::UltraLow => config.ultra_low_latency_poll_interval,
        LatencyClass::Low => config.low_latency_poll_interval,
        LatencyClass::Normal => config.poll_interval,
    }
}

pub struct ManifestObserver {
    source: Arc<dyn StreamSource>,
    extractor: Arc<dyn TrackExtractor>,
    config: ObserverConfig,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ManifestObserver {
    pub fn new(
        source: Arc<dyn StreamSource>,
        extractor: Arc<dyn TrackExtractor>,
        config: ObserverConfig,
    ) -> Self {
        Self {
            source,
            extractor,
            config,
            token: CancellationToken::new(),
            handle: None,
        }
    }

    /// Waits until the stream is live, learns its characteristics and starts
    /// the poll loop, which reports through `events`.
    pub async fn connect(
        &mut self,
        events: mpsc::Sender<ObserverEvent>,
    ) -> Result<StreamInfo, LiveError> {
        self.wait_until_live().await?;
        let info = self.fetch_stream_info().await?;

        let interval = poll_interval(&self.config, &info);
        info!(
            title = %info.title,
            latency = ?info.latency_class,
            dvr = info.is_dvr_enabled,
            premiere = info.is_premiere,
            interval_ms = interval.as_millis() as u64,
            "Stream is live, starting manifest polling"
        );

        let poll_loop = PollLoop {
            source: Arc::clone(&self.source),
            extractor: Arc::clone(&self.extractor),
            config: self.config.clone(),
            manifest_url: info.manifest_url.clone(),
            last_url_refresh: Instant::now(),
            interval,
            seen: SeenSet::new(),
            events,
            token: self.token.clone(),
        };
        self.handle = Some(tokio::spawn(poll_loop.run()));

        Ok(info)
    }

    /// Stops polling. Safe to call any number of times.
    pub fn disconnect(&self) {
        if !self.token.is_cancelled() {
            debug!("Disconnecting manifest observer");
        }
        self.token.cancel();
    }

    /// Waits for the poll loop to exit.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take()
            && let Err(e) = handle.await
        {
            error!(error = %e, "Manifest poll loop panicked");
        }
    }

    async fn wait_until_live(&self) -> Result<(), LiveError> {
        let mut consecutive_errors = 0;
        loop {
            let delay = match self.source.check_availability().await {
                Ok(Availability::Live) => return Ok(()),
                Ok(Availability::Offline { reason }) => {
                    consecutive_errors = 0;
                    info!(reason = %reason, "Stream is not live yet, waiting");
                    self.config.offline_backoff
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(error = %e, attempt = consecutive_errors, "Availability check failed");
                    if consecutive_errors >= self.config.connect_attempts {
                        return Err(LiveError::connection(format!(
                            "availability check failed {consecutive_errors} times: {e}"
                        )));
                    }
                    self.config.availability_error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(LiveError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn fetch_stream_info(&self) -> Result<StreamInfo, LiveError> {
        let mut last_error = None;
        for attempt in 1..=self.config.connect_attempts {
            match self.source.stream_info().await {
                Ok(info) => return Ok(info),
                Err(e) => {
                    warn!(error = %e, attempt, "Failed to fetch stream info");
                    last_error = Some(e);
                }
            }
            if attempt < self.config.connect_attempts {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => return Err(LiveError::Cancelled),
                    _ = tokio::time::sleep(self.config.availability_error_backoff) => {}
                }
            }
        }
        Err(LiveError::connection(match last_error {
            Some(e) => format!(
                "stream info unavailable after {} attempts: {e}",
                self.config.connect_attempts
            ),
            None => "no connection attempts configured".to_string(),
        }))
    }
}

impl Drop for ManifestObserver {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct PollLoop {
    source: Arc<dyn StreamSource>,
    extractor: Arc<dyn TrackExtractor>,
    config: ObserverConfig,
    manifest_url: String,
    last_url_refresh: Instant,
    interval: Duration,
    seen: SeenSet,
    events: mpsc::Sender<ObserverEvent>,
    token: CancellationToken,
}

enum PollResult {
    Continue,
    Ended,
}

impl PollLoop {
    async fn run(mut self) {
        let token = self.token.clone();
        loop {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Manifest observer cancelled during poll");
                    return;
                }
                outcome = self.poll_once() => outcome,
            };

            match outcome {
                Ok(PollResult::Ended) => {
                    info!("Manifest is final, stream ended");
                    // StreamEnded is sent once; the loop exits right after.
                    let _ = self.events.send(ObserverEvent::StreamEnded).await;
                    return;
                }
                Ok(PollResult::Continue) => {}
                Err(e) if e.is_fatal() => {
                    debug!(error = %e, "Manifest poll loop stopping");
                    return;
                }
                Err(e) => warn!(error = %e, "Manifest poll failed, retrying next cycle"),
            }

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!("Manifest observer cancelled while idle");
                    return;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    async fn poll_once(&mut self) -> Result<PollResult, LiveError> {
        self.refresh_manifest_url().await;

        let timeout = self.config.manifest_timeout;
        let manifest = tokio::time::timeout(
            timeout,
            self.source.fetch_manifest(&self.manifest_url, timeout),
        )
        .await
        .map_err(|_| LiveError::timeout(format!("manifest poll exceeded {timeout:?}")))??;

        let tracks = self.extractor.extract(&manifest)?;

        for kind in TrackKind::ALL {
            let fresh = self.seen.mark_new(kind, tracks.track(kind));
            if fresh.is_empty() {
                continue;
            }
            trace!(
                track = %kind,
                count = fresh.len(),
                first = fresh.first().map(|c| c.sequence_id),
                "New chunks discovered"
            );
            let event = ObserverEvent::NewChunks {
                kind,
                chunks: fresh,
            };
            if self.events.send(event).await.is_err() {
                debug!("Observer event receiver dropped");
                return Err(LiveError::Cancelled);
            }
        }

        if tracks.is_final {
            Ok(PollResult::Ended)
        } else {
            Ok(PollResult::Continue)
        }
    }

    async fn refresh_manifest_url(&mut self) {
        if self.last_url_refresh.elapsed() < self.config.manifest_url_refresh_interval {
            return;
        }
        self.last_url_refresh = Instant::now();
        let timeout = self.config.manifest_timeout;
        match tokio::time::timeout(timeout, self.source.stream_info()).await {
            Ok(Ok(info)) => {
                if info.manifest_url != self.manifest_url {
                    info!("Manifest URL refreshed");
                    self.manifest_url = info.manifest_url;
                }
            }
            Ok(Err(e)) => warn!(error = %e, "Manifest URL refresh failed, keeping the old one"),
            Err(_) => warn!(?timeout, "Manifest URL refresh timed out, keeping the old one"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::manifest::ExtractedTracks;

    /// Each manifest body is `<video ids>|<audio ids>|<final>`, e.g. `1,2|1|0`.
    struct ScriptedExtractor;

    impl TrackExtractor for ScriptedExtractor {
        fn extract(&self, manifest: &[u8]) -> Result<ExtractedTracks, LiveError> {
            let text = std::str::from_utf8(manifest).map_err(|_| LiveError::manifest_parse("utf8"))?;
            let parts: Vec<&str> = text.split('|').collect();
            if parts.len() != 3 {
                return Err(LiveError::manifest_parse("bad script"));
            }
            let ids = |s: &str, kind: TrackKind| -> Vec<ChunkRef> {
                s.split(',')
                    .filter(|p| !p.is_empty())
                    .map(|p| {
                        let id = p.parse().unwrap();
                        ChunkRef::new(kind, id, format!("https://cdn/{kind}/sq/{id}/"))
                    })
                    .collect()
            };
            Ok(ExtractedTracks {
                video: ids(parts[0], TrackKind::Video),
                audio: ids(parts[1], TrackKind::Audio),
                is_final: parts[2] == "1",
            })
        }
    }

    /// Manifest body that never resolves.
    const HANG: &str = "hang";

    struct ScriptedSource {
        availability: Mutex<VecDeque<Result<Availability, LiveError>>>,
        manifests: Mutex<VecDeque<Result<&'static str, LiveError>>>,
        /// Manifest URLs handed out by `stream_info`; `None` never resolves.
        info_urls: Mutex<VecDeque<Option<&'static str>>>,
        fetched_urls: Mutex<Vec<String>>,
        info_failures: AtomicUsize,
        polls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(manifests: Vec<Result<&'static str, LiveError>>) -> Self {
            Self {
                availability: Mutex::new(VecDeque::new()),
                manifests: Mutex::new(manifests.into()),
                info_urls: Mutex::new(VecDeque::new()),
                fetched_urls: Mutex::new(Vec::new()),
                info_failures: AtomicUsize::new(0),
                polls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        async fn check_availability(&self) -> Result<Availability, LiveError> {
            self.availability
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(Availability::Live))
        }

        async fn stream_info(&self) -> Result<StreamInfo, LiveError> {
            if self.info_failures.load(Ordering::SeqCst) > 0 {
                self.info_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(LiveError::manifest_fetch("info down"));
            }
            let next = self.info_urls.lock().unwrap().pop_front();
            match next {
                Some(Some(url)) => Ok(StreamInfo::new(url)),
                Some(None) => std::future::pending().await,
                None => Ok(StreamInfo::new("https://host/manifest.mpd")),
            }
        }

        async fn fetch_manifest(&self, url: &str, _timeout: Duration) -> Result<Bytes, LiveError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            self.fetched_urls.lock().unwrap().push(url.to_string());
            let next = self.manifests.lock().unwrap().pop_front();
            match next {
                Some(Ok(body)) if body == HANG => std::future::pending().await,
                Some(Ok(body)) => Ok(Bytes::from_static(body.as_bytes())),
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    fn observer(source: Arc<ScriptedSource>) -> ManifestObserver {
        ManifestObserver::new(source, Arc::new(ScriptedExtractor), ObserverConfig::default())
    }

    async fn collect(mut rx: mpsc::Receiver<ObserverEvent>) -> (Vec<(TrackKind, u64)>, usize) {
        let mut chunks = Vec::new();
        let mut ended = 0;
        while let Some(event) = rx.recv().await {
            match event {
                ObserverEvent::NewChunks { kind, chunks: batch } => {
                    chunks.extend(batch.into_iter().map(|c| (kind, c.sequence_id)))
                }
                ObserverEvent::StreamEnded => ended += 1,
            }
        }
        (chunks, ended)
    }

    #[test]
    fn seen_set_surfaces_each_id_once() {
        let mut seen = SeenSet::new();
        let batch: Vec<_> = (1..=3)
            .map(|i| ChunkRef::new(TrackKind::Video, i, "u"))
            .collect();
        assert_eq!(seen.mark_new(TrackKind::Video, &batch).len(), 3);
        assert!(seen.mark_new(TrackKind::Video, &batch).is_empty());
        assert_eq!(seen.mark_new(TrackKind::Audio, &batch[..1]).len(), 1);
        let fresh = seen.mark_new(TrackKind::Audio, &batch);
        assert_eq!(fresh.iter().map(|c| c.sequence_id).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn interval_follows_latency_class() {
        let config = ObserverConfig::default();
        let mut info = StreamInfo::new("u");
        assert_eq!(poll_interval(&config, &info), Duration::from_secs(5));
        info.latency_class = LatencyClass::Low;
        assert_eq!(poll_interval(&config, &info), Duration::from_secs(4));
        info.latency_class = LatencyClass::UltraLow;
        assert_eq!(poll_interval(&config, &info), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_polls_never_repeat_ids() {
        let source = Arc::new(ScriptedSource::new(vec![
            Ok("1,2,3|1,2|0"),
            Ok("2,3,4|1,2,3,4|0"),
            Err(LiveError::manifest_fetch("flaky")),
            Ok("3,4,5|4,5|1"),
        ]));
        let (tx, rx) = mpsc::channel(16);
        let mut observer = observer(Arc::clone(&source));
        observer.connect(tx).await.unwrap();

        let (chunks, ended) = collect(rx).await;
        observer.join().await;

        let video: Vec<u64> = chunks
            .iter()
            .filter(|(k, _)| *k == TrackKind::Video)
            .map(|(_, id)| *id)
            .collect();
        let audio: Vec<u64> = chunks
            .iter()
            .filter(|(k, _)| *k == TrackKind::Audio)
            .map(|(_, id)| *id)
            .collect();
        assert_eq!(video, vec![1, 2, 3, 4, 5]);
        assert_eq!(audio, vec![1, 2, 3, 4, 5]);
        assert_eq!(ended, 1);
        assert_eq!(source.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_while_offline() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("1|1|1")]));
        source.availability.lock().unwrap().extend([
            Ok(Availability::Offline {
                reason: "scheduled".into(),
            }),
            Ok(Availability::Offline {
                reason: "scheduled".into(),
            }),
        ]);
        let started = Instant::now();
        let (tx, rx) = mpsc::channel(16);
        let mut observer = observer(source);
        observer.connect(tx).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));

        let (chunks, ended) = collect(rx).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(ended, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_connect_failures_are_fatal() {
        let source = Arc::new(ScriptedSource::new(vec![]));
        source.info_failures.store(3, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(16);
        let err = observer(source).connect(tx).await.unwrap_err();
        assert!(matches!(err, LiveError::Connection { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_info_failure_recovers() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("1|1|1")]));
        source.info_failures.store(2, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(16);
        assert!(observer(source).connect(tx).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_polling_and_is_idempotent() {
        // No manifests scripted: the first poll hangs until cancelled.
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (tx, rx) = mpsc::channel(16);
        let mut observer = observer(source);
        observer.connect(tx).await.unwrap();

        observer.disconnect();
        observer.disconnect();
        observer.join().await;

        let (chunks, ended) = collect(rx).await;
        assert!(chunks.is_empty());
        assert_eq!(ended, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_manifest_fetch_times_out_and_polling_continues() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(HANG), Ok("1|1|0"), Ok("2|2|1")]));
        let (tx, rx) = mpsc::channel(16);
        let mut observer = observer(Arc::clone(&source));
        let started = Instant::now();
        observer.connect(tx).await.unwrap();

        let (chunks, ended) = collect(rx).await;
        observer.join().await;

        assert_eq!(source.polls.load(Ordering::SeqCst), 3);
        assert_eq!(chunks.len(), 4);
        assert_eq!(ended, 1);
        // one 8s manifest timeout plus two 5s poll intervals
        assert!(started.elapsed() >= Duration::from_secs(18));
    }

    fn refreshing_observer(source: Arc<ScriptedSource>) -> ManifestObserver {
        let config = ObserverConfig {
            manifest_url_refresh_interval: Duration::from_secs(1),
            ..ObserverConfig::default()
        };
        ManifestObserver::new(source, Arc::new(ScriptedExtractor), config)
    }

    #[tokio::test(start_paused = true)]
    async fn manifest_url_is_refreshed_periodically() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("1|1|0"), Ok("2|2|1")]));
        source.info_urls.lock().unwrap().extend([
            Some("https://host/manifest.mpd"),
            Some("https://host/refreshed.mpd"),
        ]);
        let (tx, rx) = mpsc::channel(16);
        let mut observer = refreshing_observer(Arc::clone(&source));
        observer.connect(tx).await.unwrap();

        let (chunks, ended) = collect(rx).await;
        observer.join().await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(ended, 1);
        assert_eq!(
            *source.fetched_urls.lock().unwrap(),
            vec![
                "https://host/manifest.mpd".to_string(),
                "https://host/refreshed.mpd".to_string(),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_url_refresh_keeps_old_url() {
        let source = Arc::new(ScriptedSource::new(vec![Ok("1|1|0"), Ok("2|2|1")]));
        source
            .info_urls
            .lock()
            .unwrap()
            .extend([Some("https://host/manifest.mpd"), None]);
        let (tx, rx) = mpsc::channel(16);
        let mut observer = refreshing_observer(Arc::clone(&source));
        observer.connect(tx).await.unwrap();

        let (chunks, ended) = collect(rx).await;
        observer.join().await;

        assert_eq!(chunks.len(), 4);
        assert_eq!(ended, 1);
        let fetched = source.fetched_urls.lock().unwrap();
        assert!(fetched.iter().all(|u| u == "https://host/manifest.mpd"));
    }
}
