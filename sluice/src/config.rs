//! Service and worker configuration.

use serde::{Deserialize, Serialize};

use crate::pool::{DEFAULT_MAX_CONCURRENT, DEFAULT_SETTLE_DELAY_MS};

/// Configuration for [`crate::DownloadService`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Maximum simultaneously running workers. Clamped to the pool bounds at
    /// runtime via the same validation `set_max_concurrent` applies.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Delay after a worker finishes before the next admission round, in
    /// milliseconds. Batches bursts of completions into one queue scan.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Capacity of the broadcast event channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Worker subprocess configuration.
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_settle_delay_ms() -> u64 {
    DEFAULT_SETTLE_DELAY_MS
}

fn default_event_capacity() -> usize {
    256
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            settle_delay_ms: default_settle_delay_ms(),
            event_capacity: default_event_capacity(),
            worker: WorkerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Set the maximum number of simultaneously running workers.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Set the post-completion settle delay.
    pub fn with_settle_delay_ms(mut self, millis: u64) -> Self {
        self.settle_delay_ms = millis;
        self
    }

    /// Set the worker configuration.
    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }
}

/// Configuration for the ffmpeg worker subprocess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the ffmpeg binary.
    #[serde(default = "default_binary_path")]
    pub binary_path: String,
    /// Additional input arguments, inserted before `-i`.
    #[serde(default)]
    pub input_args: Vec<String>,
    /// Additional output arguments, inserted before the output path.
    #[serde(default)]
    pub output_args: Vec<String>,
    /// User agent string passed to the worker.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Request headers passed to the worker.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    /// How many trailing stderr lines to keep for failure diagnostics.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

fn default_binary_path() -> String {
    "ffmpeg".to_string()
}

fn default_stderr_tail_lines() -> usize {
    8
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            user_agent: None,
            headers: Vec::new(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

impl WorkerConfig {
    /// Set the ffmpeg binary path.
    pub fn with_binary_path(mut self, path: impl Into<String>) -> Self {
        self.binary_path = path.into();
        self
    }

    /// Set the user agent.
    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Add a request header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.settle_delay_ms, 250);
        assert_eq!(config.worker.binary_path, "ffmpeg");
        assert_eq!(config.worker.stderr_tail_lines, 8);
    }

    #[test]
    fn test_builders() {
        let config = ServiceConfig::default()
            .with_max_concurrent(5)
            .with_settle_delay_ms(10)
            .with_worker(
                WorkerConfig::default()
                    .with_binary_path("/opt/ffmpeg/bin/ffmpeg")
                    .with_user_agent("sluice/0.1")
                    .with_header("Referer", "https://example.com"),
            );
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.settle_delay_ms, 10);
        assert_eq!(config.worker.binary_path, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(config.worker.headers.len(), 1);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.worker.binary_path, "ffmpeg");
    }
}
