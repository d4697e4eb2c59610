//! Where manifests come from.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LiveError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Live,
    Offline { reason: String },
}

/// How aggressively the broadcaster trades buffering for delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LatencyClass {
    #[default]
    Normal,
    Low,
    UltraLow,
}

impl LatencyClass {
    pub fn is_low_latency(&self) -> bool {
        !matches!(self, Self::Normal)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub manifest_url: String,
    pub title: String,
    pub latency_class: LatencyClass,
    pub is_dvr_enabled: bool,
    pub is_premiere: bool,
}

impl StreamInfo {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            title: String::new(),
            latency_class: LatencyClass::Normal,
            is_dvr_enabled: false,
            is_premiere: false,
        }
    }

    pub fn is_low_latency(&self) -> bool {
        self.latency_class.is_low_latency()
    }
}

#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn check_availability(&self) -> Result<Availability, LiveError>;

    /// Refreshes metadata; the manifest url in the result may differ between calls.
    async fn stream_info(&self) -> Result<StreamInfo, LiveError>;

    async fn fetch_manifest(&self, url: &str, timeout: Duration) -> Result<Bytes, LiveError>;
}

/// Serves a fixed manifest url over HTTP with caller-supplied metadata.
pub struct HttpManifestSource {
    client: Client,
    info: StreamInfo,
}

impl HttpManifestSource {
    pub fn new(client: Client, info: StreamInfo) -> Self {
        Self { client, info }
    }

    fn offline_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN | StatusCode::GONE
        )
    }
}

#[async_trait]
impl StreamSource for HttpManifestSource {
    async fn check_availability(&self) -> Result<Availability, LiveError> {
        let response = self.client.get(&self.info.manifest_url).send().await?;
        let status = response.status();
        debug!(status = %status, "Availability probe");
        if status.is_success() {
            Ok(Availability::Live)
        } else if Self::offline_status(status) {
            Ok(Availability::Offline {
                reason: format!("manifest answered HTTP {status}"),
            })
        } else {
            Err(LiveError::http_status(status, &self.info.manifest_url))
        }
    }

    async fn stream_info(&self) -> Result<StreamInfo, LiveError> {
        Ok(self.info.clone())
    }

    async fn fetch_manifest(&self, url: &str, timeout: Duration) -> Result<Bytes, LiveError> {
        let response = self.client.get(url).timeout(timeout).send().await.map_err(|e| {
            if e.is_timeout() {
                LiveError::timeout(format!("manifest request to {url}"))
            } else {
                LiveError::manifest_fetch(e.to_string())
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            return Err(LiveError::http_status(status, url));
        }
        let body = response.bytes().await?;
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_class_flags() {
        assert!(!LatencyClass::Normal.is_low_latency());
        assert!(LatencyClass::Low.is_low_latency());
        assert!(LatencyClass::UltraLow.is_low_latency());
    }

    #[test]
    fn offline_statuses() {
        assert!(HttpManifestSource::offline_status(StatusCode::GONE));
        assert!(!HttpManifestSource::offline_status(StatusCode::BAD_GATEWAY));
    }
}
