//! Short-lived helper processes (installer runs, version checks).
//!
//! Output is streamed line by line into the process log channel, bracketed
//! by `start` and `end` entries. A non-zero exit becomes
//! [`Error::HelperCommand`] carrying the captured stderr lines.

use crate::error::{Error, Result};
use crate::logs::{LogAggregator, LogKind};
use async_process::{Command, Stdio};
use futures_lite::StreamExt;
use futures_lite::io::{AsyncBufReadExt, AsyncRead, BufReader};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a successful helper command produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperOutput {
    /// Standard output lines
    pub stdout: Vec<String>,
    /// Standard error lines
    pub stderr: Vec<String>,
    /// Wall-clock run time
    pub duration: Duration,
}

/// Runs helper commands and records them in the process log
#[derive(Debug, Clone)]
pub struct HelperRunner {
    logs: Arc<LogAggregator>,
}

impl HelperRunner {
    /// Create a runner writing to `logs.process()`
    pub fn new(logs: Arc<LogAggregator>) -> Self {
        Self { logs }
    }

    /// Run `program` with `args` to completion.
    pub async fn run<I, S>(&self, program: impl AsRef<Path>, args: I) -> Result<HelperOutput>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = program.as_ref();
        let args: Vec<OsString> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
        let rendered = command_line(program, &args);
        let channel = self.logs.process();

        tracing::debug!(command = %rendered, "Running helper command");
        channel.log(LogKind::Start, &format!("$ {}", rendered));
        let started = Instant::now();

        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                channel.log(LogKind::Error, &format!("Failed to run {}: {}", rendered, e));
                Error::HelperCommand {
                    command: rendered.clone(),
                    stderr: e.to_string(),
                }
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Process("Failed to get stdout pipe from helper".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Process("Failed to get stderr pipe from helper".to_string()))?;

        let (status, stdout_lines, stderr_lines) = tokio::join!(
            child.status(),
            collect_lines(stdout, &self.logs, LogKind::Stdout),
            collect_lines(stderr, &self.logs, LogKind::Stderr),
        );
        let duration = started.elapsed();

        let status = status.map_err(|e| {
            Error::Process(format!("Failed to wait for {}: {}", rendered, e))
        })?;
        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        channel.log(
            LogKind::End,
            &format!(
                "{} exited with {} in {:.2}s",
                rendered,
                code,
                duration.as_secs_f64()
            ),
        );

        if !status.success() {
            tracing::warn!(command = %rendered, exit = %code, "Helper command failed");
            return Err(Error::HelperCommand {
                command: rendered,
                stderr: stderr_lines.join("\n"),
            });
        }

        Ok(HelperOutput {
            stdout: stdout_lines,
            stderr: stderr_lines,
            duration,
        })
    }
}

async fn collect_lines<R>(reader: R, logs: &LogAggregator, kind: LogKind) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let mut collected = Vec::new();
    let mut lines = BufReader::new(reader).split(b'\n');
    while let Some(Ok(raw)) = lines.next().await {
        let line = decode_line(&raw);
        logs.process().log(kind, &line);
        collected.push(line);
    }
    collected
}

/// Decode one raw output line; invalid UTF-8 is replaced, not fatal.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches('\r')
        .to_string()
}

/// Render a command and its arguments as one shell-like line
pub fn command_line(program: &Path, args: &[OsString]) -> String {
    std::iter::once(program.as_os_str())
        .chain(args.iter().map(OsString::as_os_str))
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}
