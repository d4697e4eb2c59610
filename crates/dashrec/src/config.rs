use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

use crate::error::LiveError;
use crate::strategy::ConcatStrategy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// HTTP client settings shared by manifest polls and chunk fetches.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub user_agent: String,

    /// Merged on top of [`HttpConfig::get_default_headers`].
    pub headers: HeaderMap,

    pub connect_timeout: Duration,

    pub follow_redirects: bool,

    pub danger_accept_invalid_certs: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            danger_accept_invalid_certs: false,
        }
    }
}

impl HttpConfig {
    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers
    }

    /// Merges a `Name: value` block (one header per line) into the header map.
    ///
    /// Everything after the first colon is the value, so values may contain colons.
    pub fn with_raw_headers(mut self, raw: &str) -> Result<Self, LiveError> {
        for line in raw.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
            let (name, value) = line.split_once(':').ok_or_else(|| {
                LiveError::configuration(format!("invalid HTTP header line: {line}"))
            })?;
            let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
                LiveError::configuration(format!("invalid HTTP header name `{name}`: {e}"))
            })?;
            let value = HeaderValue::from_str(value.trim()).map_err(|e| {
                LiveError::configuration(format!("invalid HTTP header value for `{name}`: {e}"))
            })?;
            self.headers.insert(name, value);
        }
        Ok(self)
    }
}

/// Manifest observer timing.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Poll interval for ordinary live streams.
    pub poll_interval: Duration,
    /// Poll interval for low-latency streams.
    pub low_latency_poll_interval: Duration,
    /// Poll interval when the latency class ends with `ULTRA_LOW`.
    pub ultra_low_latency_poll_interval: Duration,
    /// Per-request bound for one manifest refetch.
    pub manifest_timeout: Duration,
    /// Wait between availability checks while the stream is not yet live.
    pub offline_backoff: Duration,
    /// Wait after a failed availability check.
    pub availability_error_backoff: Duration,
    /// Attempts for the initial stream-info fetch before the connection is fatal.
    pub connect_attempts: u32,
    /// How often the manifest url itself is refreshed from the source.
    pub manifest_url_refresh_interval: Duration,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            low_latency_poll_interval: Duration::from_secs(4),
            ultra_low_latency_poll_interval: Duration::from_secs(3),
            manifest_timeout: Duration::from_secs(8),
            offline_backoff: Duration::from_secs(15),
            availability_error_backoff: Duration::from_secs(3),
            connect_attempts: 3,
            manifest_url_refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// Segment task scheduler limits.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_workers: usize,
    /// Failed attempts tolerated before a chunk is dropped.
    pub max_retries: u32,
    pub base_fetch_timeout: Duration,
    pub fetch_timeout_step: Duration,
    pub max_fetch_timeout: Duration,
    /// Sleep after every successful fetch to self-throttle the request rate.
    pub cooldown: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            max_retries: 10,
            base_fetch_timeout: Duration::from_secs(15),
            fetch_timeout_step: Duration::from_secs(15),
            max_fetch_timeout: Duration::from_secs(45),
            cooldown: None,
        }
    }
}

impl SchedulerConfig {
    /// Timeout for a fetch that already failed `retry_count` times.
    pub fn fetch_timeout(&self, retry_count: u32) -> Duration {
        self.fetch_timeout_step
            .checked_mul(retry_count)
            .and_then(|extra| self.base_fetch_timeout.checked_add(extra))
            .unwrap_or(self.max_fetch_timeout)
            .min(self.max_fetch_timeout)
    }
}

/// What to do when the finished video and audio counts differ.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CountMismatchPolicy {
    /// Fall through to id matching; unmatched chunks become orphans.
    #[default]
    MatchById,
    /// Abort reconciliation and leave the working directory for manual recovery.
    Abort,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileConfig {
    /// Collapse every run into a single output, accepting discontinuities.
    pub force_merge: bool,
    /// Explicit join strategy; skips probing and heuristics.
    pub concat_override: Option<ConcatStrategy>,
    pub count_mismatch: CountMismatchPolicy,
    /// Keep the working directory even when every run succeeded.
    pub keep_temporary_files: bool,
}

/// External tool locations.
#[derive(Debug, Clone)]
pub struct ToolConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub probe_timeout: Duration,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string()),
            ffprobe_path: std::env::var("FFPROBE_PATH").unwrap_or_else(|_| "ffprobe".to_string()),
            probe_timeout: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub http: HttpConfig,
    pub observer: ObserverConfig,
    pub scheduler: SchedulerConfig,
    pub reconcile: ReconcileConfig,
    pub tools: ToolConfig,
    /// Directory receiving the working directory and the muxed outputs.
    pub output_dir: PathBuf,
    /// Output container extension, without the dot.
    pub container: String,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig::default(),
            observer: ObserverConfig::default(),
            scheduler: SchedulerConfig::default(),
            reconcile: ReconcileConfig::default(),
            tools: ToolConfig::default(),
            output_dir: PathBuf::from("."),
            container: "mp4".to_string(),
        }
    }
}

impl LiveConfig {
    pub fn builder() -> LiveConfigBuilder {
        LiveConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct LiveConfigBuilder {
    config: LiveConfig,
}

impl LiveConfigBuilder {
    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.config.http = http;
        self
    }

    pub fn with_observer(mut self, observer: ObserverConfig) -> Self {
        self.config.observer = observer;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.config.scheduler.max_workers = max_workers.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Option<Duration>) -> Self {
        self.config.scheduler.cooldown = cooldown.filter(|d| !d.is_zero());
        self
    }

    pub fn with_force_merge(mut self, force_merge: bool) -> Self {
        self.config.reconcile.force_merge = force_merge;
        self
    }

    pub fn with_concat_override(mut self, strategy: Option<ConcatStrategy>) -> Self {
        self.config.reconcile.concat_override = strategy;
        self
    }

    pub fn with_count_mismatch(mut self, policy: CountMismatchPolicy) -> Self {
        self.config.reconcile.count_mismatch = policy;
        self
    }

    pub fn with_keep_temporary_files(mut self, keep: bool) -> Self {
        self.config.reconcile.keep_temporary_files = keep;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.output_dir = dir.into();
        self
    }

    pub fn with_container(mut self, container: impl Into<String>) -> Self {
        self.config.container = container.into();
        self
    }

    pub fn build(self) -> LiveConfig {
        self.config
    }
}
