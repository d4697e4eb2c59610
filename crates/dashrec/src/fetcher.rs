use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::trace;

use crate::error::LiveError;

/// Downloads one chunk to disk.
#[async_trait]
pub trait ChunkFetcher: Send + Sync {
    async fn fetch(&self, url: &str, destination: &Path, timeout: Duration)
    -> Result<(), LiveError>;
}

pub struct HttpChunkFetcher {
    client: Client,
}

impl HttpChunkFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn download(
        &self,
        url: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<u64, LiveError> {
        let response = self.client.get(url).timeout(timeout).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LiveError::http_status(status, url));
        }

        let expected = response.content_length();
        let mut file = tokio::fs::File::create(destination).await?;
        let mut received: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            received += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        if let Some(expected) = expected
            && expected != received
        {
            return Err(LiveError::IncompleteTransfer {
                url: url.to_string(),
                expected,
                received,
            });
        }
        Ok(received)
    }
}

#[async_trait]
impl ChunkFetcher for HttpChunkFetcher {
    async fn fetch(
        &self,
        url: &str,
        destination: &Path,
        timeout: Duration,
    ) -> Result<(), LiveError> {
        match self.download(url, destination, timeout).await {
            Ok(bytes) => {
                trace!(url, bytes, "Chunk written");
                Ok(())
            }
            Err(e) => {
                // Leave no partial chunk behind for the reconciler to pick up.
                let _ = tokio::fs::remove_file(destination).await;
                Err(e)
            }
        }
    }
}
