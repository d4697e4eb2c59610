use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::ToolConfig;
use crate::error::LiveError;
use crate::strategy::{ProbeOutcome, Prober};
use crate::utils::tokio_command;

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    packets: Vec<ProbePacket>,
}

#[derive(Debug, Deserialize)]
struct ProbePacket {
    pts: Option<i64>,
}

/// Reads the first packet timestamp of a chunk with `ffprobe`.
pub struct FfprobeProber {
    program: String,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            program: tools.ffprobe_path.clone(),
            timeout: tools.probe_timeout,
        }
    }

    async fn first_packet_pts(&self, path: &Path) -> Result<i64, LiveError> {
        let mut cmd = tokio_command(&self.program);
        cmd.args([
            "-hide_banner",
            "-v",
            "error",
            "-show_packets",
            "-print_format",
            "json",
        ])
        .arg(path)
        .stdin(Stdio::null())
        .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| LiveError::timeout(format!("ffprobe exceeded {:?}", self.timeout)))??;

        if !output.status.success() {
            return Err(LiveError::Probe {
                reason: format!(
                    "ffprobe exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        parse_first_pts(&output.stdout)
    }
}

pub(crate) fn parse_first_pts(stdout: &[u8]) -> Result<i64, LiveError> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout).map_err(|e| LiveError::Probe {
        reason: format!("unreadable ffprobe output: {e}"),
    })?;
    parsed
        .packets
        .first()
        .and_then(|p| p.pts)
        .ok_or_else(|| LiveError::Probe {
            reason: "no packet with a timestamp".to_string(),
        })
}

/// Whether `program -version` runs successfully.
pub async fn tool_available(program: &str) -> bool {
    let mut cmd = tokio_command(program);
    cmd.arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match cmd.status().await {
        Ok(status) => status.success(),
        Err(e) => {
            debug!(program, error = %e, "Tool not runnable");
            false
        }
    }
}

#[async_trait]
impl Prober for FfprobeProber {
    async fn is_available(&self) -> bool {
        tool_available(&self.program).await
    }

    async fn probe(&self, path: &Path) -> ProbeOutcome {
        match self.first_packet_pts(path).await {
            Ok(pts) => {
                debug!(path = %path.display(), pts, "Probed chunk");
                ProbeOutcome::FirstPacketPts(pts)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Probe failed");
                ProbeOutcome::Unknown
            }
        }
    }
}
