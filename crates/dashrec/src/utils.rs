//! Filename and child-process helpers.

use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::LiveError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

const DEFAULT_FILENAME: &str = "output";
const STDERR_TAIL_LINES: usize = 8;

/// Strips characters that are invalid in filenames.
pub fn sanitize_filename(input: &str) -> String {
    let invalid_chars = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
    let result: String = input
        .chars()
        .filter(|c| !invalid_chars.contains(c) && *c >= ' ')
        .collect();

    let result = result.trim_matches(|c| c == '.' || c == ' ');
    if result.is_empty() {
        DEFAULT_FILENAME.to_string()
    } else if result.chars().count() > 200 {
        result.chars().take(200).collect()
    } else {
        result.to_string()
    }
}

/// A `tokio::process::Command` that does not pop up a console window on Windows.
pub fn tokio_command(program: impl AsRef<OsStr>) -> Command {
    #[allow(unused_mut)]
    let mut cmd = Command::new(program);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(CREATE_NO_WINDOW);
    }
    cmd
}

pub struct CommandOutput {
    pub status: ExitStatus,
    /// Last few stderr lines, for error messages.
    pub stderr_tail: Vec<String>,
}

/// Runs `command` to completion, forwarding its stderr to the log.
pub async fn run_command_with_logs(command: &mut Command) -> Result<CommandOutput, LiveError> {
    command.stdin(Stdio::null());
    command.stdout(Stdio::null());
    command.stderr(Stdio::piped());
    command.kill_on_drop(true);

    let mut child = command.spawn()?;

    let reader = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut tail = Vec::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.to_lowercase().contains("error") {
                    warn!("stderr: {}", line);
                } else {
                    debug!("stderr: {}", line);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.remove(0);
                }
                tail.push(line);
            }
            tail
        })
    });

    let status = child.wait().await?;
    let stderr_tail = match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    };

    Ok(CommandOutput {
        status,
        stderr_tail,
    })
}
