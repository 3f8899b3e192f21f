//! Download task model and status state machine.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a download task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Queued, not yet admitted by the pool.
    Waiting,
    /// Worker subprocess is running.
    Downloading,
    /// Marked paused by the host; see [`crate::DownloadService::pause`]
    /// for the contract.
    Paused,
    /// Worker exited successfully.
    Completed,
    /// Worker exited with a failure, or could not be spawned.
    Failed,
    /// Cancelled before or during transfer.
    Cancelled,
}

impl TaskStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Waiting, Downloading) | (Waiting, Cancelled) => true,
            (Downloading, Paused) => true,
            (Paused, Downloading) => true,
            (Downloading | Paused, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }

    /// Lowercase name for logs and display.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Downloading => "downloading",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A download task snapshot.
///
/// The registry hands out owned clones of this struct; mutation happens only
/// through [`crate::registry::TaskRegistry`] so observers never see a task
/// mid-update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// Unique task id (uuid v4).
    pub id: String,
    /// Source media or playlist URL.
    pub url: String,
    /// Directory the output file is written into.
    pub output_dir: PathBuf,
    /// Output file name inside `output_dir`.
    pub file_name: String,
    pub status: TaskStatus,
    /// 0..=100; monotonically non-decreasing while running.
    pub progress_percent: u8,
    /// Bytes per second; 0 when unknown.
    pub speed_bytes_per_sec: u64,
    /// Estimated seconds remaining; 0 when unknown.
    pub eta_secs: u64,
    /// 0 for fresh tasks, predecessor count + 1 for retries.
    pub retry_count: u32,
    /// Playlist-derived segment count; 0 when resolution failed or pending.
    pub total_segments: u64,
    /// Derived from `progress_percent` while the worker runs.
    pub downloaded_segments: u64,
    /// Playlist-derived media duration; 0.0 when unknown.
    pub total_duration_secs: f64,
    /// Cumulative bytes reported by the worker.
    pub downloaded_bytes: u64,
    /// Previous byte sample, kept for speed deltas.
    pub last_downloaded_bytes: u64,
    /// Extrapolated final size; 0 when unknown.
    pub total_bytes_estimate: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_update_at: Option<DateTime<Utc>>,
    /// Full path of the output file, set at admission.
    pub output_path: Option<PathBuf>,
    /// Failure description, including the worker exit code.
    pub error_message: Option<String>,
}

impl DownloadTask {
    /// Create a fresh Waiting task.
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            output_dir: output_dir.into(),
            file_name: file_name.into(),
            status: TaskStatus::Waiting,
            progress_percent: 0,
            speed_bytes_per_sec: 0,
            eta_secs: 0,
            retry_count: 0,
            total_segments: 0,
            downloaded_segments: 0,
            total_duration_secs: 0.0,
            downloaded_bytes: 0,
            last_downloaded_bytes: 0,
            total_bytes_estimate: 0,
            created_at: Utc::now(),
            started_at: None,
            last_update_at: None,
            output_path: None,
            error_message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The file the worker writes to.
    pub fn output_file(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waiting_transitions() {
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Downloading));
        assert!(TaskStatus::Waiting.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Paused));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Waiting.can_transition_to(TaskStatus::Failed));
    }

    #[test]
    fn test_pause_resume_cycle() {
        assert!(TaskStatus::Downloading.can_transition_to(TaskStatus::Paused));
        assert!(TaskStatus::Paused.can_transition_to(TaskStatus::Downloading));
        assert!(!TaskStatus::Paused.can_transition_to(TaskStatus::Paused));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use TaskStatus::*;
        for terminal in [Completed, Failed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Waiting, Downloading, Paused, Completed, Failed, Cancelled] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} must not transition to {next}"
                );
            }
        }
    }

    #[test]
    fn test_running_states_can_fail_or_cancel() {
        for from in [TaskStatus::Downloading, TaskStatus::Paused] {
            assert!(from.can_transition_to(TaskStatus::Completed));
            assert!(from.can_transition_to(TaskStatus::Failed));
            assert!(from.can_transition_to(TaskStatus::Cancelled));
        }
    }

    #[test]
    fn test_new_task_defaults() {
        let task = DownloadTask::new("t1", "https://example.com/a.m3u8", "/tmp/out", "a.mp4");
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.progress_percent, 0);
        assert_eq!(task.retry_count, 0);
        assert!(task.started_at.is_none());
        assert_eq!(task.output_file(), PathBuf::from("/tmp/out/a.mp4"));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        use TaskStatus::*;
        assert_eq!(serde_json::to_string(&Waiting).unwrap(), "\"waiting\"");
        for status in [Waiting, Downloading, Paused, Completed, Failed, Cancelled] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            assert_eq!(serde_json::from_str::<TaskStatus>(&json).unwrap(), status);
        }
    }
}
