//! Image tool invocation.
//!
//! Runs the docker-compatible CLI as a subprocess and turns failures into
//! structured errors that callers can classify.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Captured output of a successful tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runs image tool commands.
///
/// The seam between the lifecycle logic and the container engine.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run the tool with `args`, optionally feeding `stdin` and overriding the
    /// working directory. Non-zero exit is an error.
    async fn invoke(
        &self,
        args: &[String],
        stdin: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<ToolOutput>;
}

/// Subprocess-backed [`ToolRunner`].
pub struct ImageTool {
    binary: PathBuf,
    log_invocations: bool,
}

impl ImageTool {
    pub fn new(binary: impl Into<PathBuf>, log_invocations: bool) -> Self {
        Self {
            binary: binary.into(),
            log_invocations,
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn failure(&self, args: &[String], exit_code: Option<i32>, message: String) -> Error {
        Error::ToolInvocation {
            tool: self.binary.display().to_string(),
            command: args.first().cloned().unwrap_or_default(),
            exit_code,
            message,
        }
    }
}

#[async_trait]
impl ToolRunner for ImageTool {
    async fn invoke(
        &self,
        args: &[String],
        stdin: Option<&str>,
        working_dir: Option<&Path>,
    ) -> Result<ToolOutput> {
        let cwd = match working_dir {
            Some(dir) => dir.display().to_string(),
            None => std::env::current_dir()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|_| ".".to_string()),
        };
        if self.log_invocations {
            info!(tool = %self.binary.display(), cwd = %cwd, ?args, "Running image tool");
        } else {
            debug!(tool = %self.binary.display(), cwd = %cwd, ?args, "Running image tool");
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| self.failure(args, None, format!("failed to spawn: {e}")))?;

        // Feed stdin only once the process exists, from a separate task so a
        // chatty child cannot block on a full stdout pipe while we write.
        let writer = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => {
                let input = input.to_owned();
                Some(tokio::spawn(async move {
                    pipe.write_all(input.as_bytes()).await?;
                    pipe.shutdown().await
                }))
            }
            _ => None,
        };

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| self.failure(args, None, format!("failed to wait: {e}")))?;

        if let Some(writer) = writer {
            match writer.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Failed to write stdin to image tool"),
                Err(e) => warn!(error = %e, "Stdin writer task failed"),
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            let message = diagnostic(&stdout, &stderr, &output.status.to_string());
            return Err(self.failure(args, output.status.code(), message));
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

/// Combine the tool's streams into one diagnostic line, preferring stderr.
fn diagnostic(stdout: &str, stderr: &str, status: &str) -> String {
    let stderr = stderr.trim();
    let stdout = stdout.trim();
    match (stderr.is_empty(), stdout.is_empty()) {
        (false, true) => stderr.to_string(),
        (false, false) => format!("{stderr} (stdout: {stdout})"),
        (true, false) => stdout.to_string(),
        (true, true) => format!("tool exited with {status}"),
    }
}

/// Outcome of classifying a failed tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The target container or image is already stopped or absent.
    NotFound,
    Other,
}

/// Diagnostics emitted by docker and podman when the target is already gone.
///
/// The docker CLI reports these with the same exit code as any other error,
/// so message matching is the only signal available.
const NOT_FOUND_PATTERNS: &[&str] = &[
    "no such container",
    "no such image",
    "is not running",
    "no container with name or id",
    "image not known",
];

/// Classify a tool failure.
///
/// Spawn failures (no exit code) are never `NotFound`; the tool did not get
/// a chance to look for anything.
pub fn classify(err: &Error) -> FailureKind {
    match err.tool_failure() {
        Some(Error::ToolInvocation {
            exit_code: Some(_),
            message,
            ..
        }) => {
            let message = message.to_ascii_lowercase();
            if NOT_FOUND_PATTERNS.iter().any(|p| message.contains(p)) {
                FailureKind::NotFound
            } else {
                FailureKind::Other
            }
        }
        _ => FailureKind::Other,
    }
}

/// Convert string-ish arguments into an owned argument vector.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
