//! Worker subprocess supervision.
//!
//! One external worker per task. The supervisor spawns it with piped stdio,
//! parses the progress stream off stdout, keeps a bounded stderr tail for
//! diagnostics, and turns the exit into exactly one terminal
//! [`WorkerOutcome`]. Cancellation kills the child and waits for it to be
//! reaped before the outcome is reported.

mod ffmpeg;
mod progress;

pub use ffmpeg::FfmpegLauncher;
pub use progress::{
    FALLBACK_FRAMES_PER_PERCENT, FALLBACK_PERCENT_CAP, ProgressParser, ProgressRecord,
};
pub(crate) use progress::apply_record;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::config::WorkerConfig;
use crate::error::{Error, Result};

/// Capacity of the per-worker event channel.
const WORKER_EVENT_CAPACITY: usize = 32;

/// Everything the worker needs to know about one download.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub task_id: String,
    pub url: String,
    pub output_dir: PathBuf,
    pub file_name: String,
}

impl WorkerRequest {
    /// The file the worker writes to.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

/// Builds the command line for a worker subprocess.
///
/// The production implementation is [`FfmpegLauncher`]; tests substitute a
/// script that fakes the progress protocol.
pub trait WorkerLauncher: Send + Sync {
    /// Assemble the command for one request. Stdio and spawning are the
    /// supervisor's business.
    fn command(&self, request: &WorkerRequest) -> Command;

    /// Whether the backing binary is present on this host.
    fn is_available(&self) -> bool;

    /// Version banner of the backing binary, when it could be probed.
    fn version(&self) -> Option<String>;
}

/// Events sent by a running worker, terminated by exactly one `Finished`.
#[derive(Debug)]
pub enum WorkerEvent {
    Progress(ProgressRecord),
    Finished(WorkerOutcome),
}

/// Terminal result of one worker run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    /// Exit status zero.
    Completed,
    /// Non-zero exit, signal death, or a wait failure.
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
    /// Killed because cancellation was requested; the child has been reaped.
    Cancelled,
}

/// Handle to one running worker.
///
/// Dropping the handle does not stop the worker; fire the cancellation token
/// passed to [`Supervisor::start`] for that.
#[derive(Debug)]
pub struct WorkerHandle {
    pub task_id: String,
    /// Progress stream, closed after the terminal event.
    pub events: mpsc::Receiver<WorkerEvent>,
}

/// Spawns and watches worker subprocesses.
pub struct Supervisor {
    launcher: Arc<dyn WorkerLauncher>,
    stderr_tail_lines: usize,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, config: &WorkerConfig) -> Self {
        Self {
            launcher,
            stderr_tail_lines: config.stderr_tail_lines,
        }
    }

    pub fn is_available(&self) -> bool {
        self.launcher.is_available()
    }

    pub fn version(&self) -> Option<String> {
        self.launcher.version()
    }

    /// Spawn the worker for `request` and start pumping its output.
    ///
    /// On success the returned handle yields `Progress` events per flushed
    /// block and ends with one `Finished`. Firing `token` kills the child;
    /// its exit is awaited before `Finished(Cancelled)` is sent.
    pub async fn start(
        &self,
        request: WorkerRequest,
        token: CancellationToken,
    ) -> Result<WorkerHandle> {
        tokio::fs::create_dir_all(&request.output_dir).await?;

        let mut command = self.launcher.command(&request);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let program = command.as_std().get_program().to_string_lossy().into_owned();
        let mut child = command.spawn().map_err(|source| Error::WorkerSpawn {
            program,
            source,
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("failed to capture worker stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Worker("failed to capture worker stderr".to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(WORKER_EVENT_CAPACITY);
        let task_id = request.task_id.clone();

        let reader_token = token.clone();
        let progress_tx = event_tx.clone();
        let reader_task_id = task_id.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ProgressParser::new();
            loop {
                tokio::select! {
                    _ = reader_token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(record) = parser.feed_line(&line) {
                                if progress_tx.send(WorkerEvent::Progress(record)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            error!(task_id = %reader_task_id, error = %e, "error reading worker stdout");
                            break;
                        }
                    }
                }
            }
        });

        let tail_limit = self.stderr_tail_lines;
        let stderr_token = token.clone();
        let stderr_task_id = task_id.clone();
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(tail_limit);
            let mut lines = BufReader::new(stderr).lines();
            // Killing the immediate child does not close the pipe while a
            // grandchild inherits it, so stop on the token rather than EOF.
            loop {
                tokio::select! {
                    _ = stderr_token.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            trace!(task_id = %stderr_task_id, line = %line, "worker stderr");
                            if tail_limit == 0 {
                                continue;
                            }
                            if tail.len() == tail_limit {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                        _ => break,
                    }
                }
            }
            tail
        });

        let wait_token = token;
        let wait_task_id = task_id.clone();
        tokio::spawn(async move {
            let exit_status = tokio::select! {
                _ = wait_token.cancelled() => {
                    debug!(task_id = %wait_task_id, "cancellation requested, killing worker");
                    // kill() also reaps the child, so the Cancelled outcome
                    // is only reported once the process is gone.
                    if let Err(e) = child.kill().await {
                        warn!(task_id = %wait_task_id, error = %e, "failed to kill worker");
                    }
                    None
                }
                status = child.wait() => Some(status),
            };

            // Join the readers first so every progress event precedes the
            // terminal one.
            let _ = stdout_task.await;
            let tail = stderr_task.await.unwrap_or_default();

            let outcome = match exit_status {
                None => WorkerOutcome::Cancelled,
                Some(Ok(status)) if status.success() => WorkerOutcome::Completed,
                Some(Ok(status)) => {
                    let exit_code = status.code();
                    let mut message = match exit_code {
                        Some(code) => format!("worker exited with code {code}"),
                        None => "worker terminated by signal".to_string(),
                    };
                    if !tail.is_empty() {
                        message.push_str(": ");
                        message.push_str(&tail.iter().cloned().collect::<Vec<_>>().join(" | "));
                    }
                    WorkerOutcome::Failed { exit_code, message }
                }
                Some(Err(e)) => WorkerOutcome::Failed {
                    exit_code: None,
                    message: format!("failed to wait for worker: {e}"),
                },
            };

            let _ = event_tx.send(WorkerEvent::Finished(outcome)).await;
        });

        Ok(WorkerHandle {
            task_id,
            events: event_rx,
        })
    }
}
