//! Joining chunk files and handing them to ffmpeg.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::ToolConfig;
use crate::error::LiveError;
use crate::probe::tool_available;
use crate::utils::{run_command_with_logs, tokio_command};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxInput {
    /// An already joined media file.
    File(PathBuf),
    /// An ffconcat list of chunk files.
    FileList(PathBuf),
}

impl MuxInput {
    pub fn path(&self) -> &Path {
        match self {
            Self::File(p) | Self::FileList(p) => p,
        }
    }
}

#[async_trait]
pub trait Muxer: Send + Sync {
    async fn is_available(&self) -> bool {
        true
    }

    /// Combines one video and one audio input into `output`, returning the
    /// path actually written.
    async fn mux(
        &self,
        video: &MuxInput,
        audio: &MuxInput,
        output: &Path,
    ) -> Result<PathBuf, LiveError>;
}

pub struct FfmpegMuxer {
    program: String,
}

impl FfmpegMuxer {
    pub fn new(tools: &ToolConfig) -> Self {
        Self {
            program: tools.ffmpeg_path.clone(),
        }
    }

    pub(crate) fn build_args(video: &MuxInput, audio: &MuxInput, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-nostdin".into()];
        for input in [video, audio] {
            if let MuxInput::FileList(_) = input {
                args.extend(["-f", "concat", "-safe", "0"].map(OsString::from));
            }
            args.push("-i".into());
            args.push(input.path().into());
        }
        args.extend(["-map", "0:v", "-map", "1:a", "-c", "copy"].map(OsString::from));

        let extension = output
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("mp4") => args.extend(["-movflags", "faststart"].map(OsString::from)),
            Some("mkv") => args.extend(["-reserve_index_space", "200k"].map(OsString::from)),
            _ => {}
        }
        args.push(output.into());
        args
    }
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn is_available(&self) -> bool {
        tool_available(&self.program).await
    }

    async fn mux(
        &self,
        video: &MuxInput,
        audio: &MuxInput,
        output: &Path,
    ) -> Result<PathBuf, LiveError> {
        let output = unique_output_path(output);
        let mut cmd = tokio_command(&self.program);
        cmd.args(Self::build_args(video, audio, &output));
        debug!(program = %self.program, output = %output.display(), "Muxing");

        let result = run_command_with_logs(&mut cmd)
            .await
            .map_err(|e| LiveError::mux(format!("failed to run {}: {e}", self.program)))?;
        if !result.status.success() {
            return Err(LiveError::mux(format!(
                "{} exited with {}: {}",
                self.program,
                result.status,
                result.stderr_tail.join(" | ")
            )));
        }
        info!(output = %output.display(), "Muxed");
        Ok(output)
    }
}

/// Appends `_<unix millis>` to the file stem when `path` already exists.
pub fn unique_output_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let millis = chrono::Utc::now().timestamp_millis();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_{millis}.{}", ext.to_string_lossy()),
        None => format!("{stem}_{millis}"),
    };
    path.with_file_name(name)
}

/// Byte-level join of `inputs`, in order, into `output`.
pub async fn concat_files(inputs: &[PathBuf], output: &Path) -> Result<u64, LiveError> {
    let mut out = tokio::fs::File::create(output).await?;
    let mut total = 0;
    for input in inputs {
        let mut file = tokio::fs::File::open(input).await?;
        total += tokio::io::copy(&mut file, &mut out).await?;
    }
    out.flush().await?;
    Ok(total)
}

/// Writes an ffconcat list with one `file '<path>'` line per input.
pub async fn write_file_list(inputs: &[PathBuf], list_path: &Path) -> Result<(), LiveError> {
    let mut body = String::new();
    for input in inputs {
        let absolute = std::path::absolute(input)?;
        let escaped = absolute.to_string_lossy().replace('\'', r"'\''");
        body.push_str(&format!("file '{escaped}'\n"));
    }
    tokio::fs::write(list_path, body).await?;
    Ok(())
}
