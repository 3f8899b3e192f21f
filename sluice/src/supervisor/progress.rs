//! Worker progress stream parsing and metric derivation.
//!
//! ffmpeg's `-progress pipe:1` output is a stream of `key=value` lines,
//! flushed in blocks terminated by a `progress=continue` (or `progress=end`)
//! line. [`ProgressParser`] accumulates one block at a time and emits a
//! [`ProgressRecord`] per terminator; [`apply_record`] folds a record into a
//! task's metrics.

use chrono::{DateTime, Utc};

use crate::task::DownloadTask;

/// Frames per fallback-percent point when the media duration is unknown,
/// roughly ten seconds of 30 fps video per point.
pub const FALLBACK_FRAMES_PER_PERCENT: u64 = 300;

/// Ceiling for the frame-based fallback estimate. Heuristic progress must
/// never read as finished; only a clean worker exit yields 100.
pub const FALLBACK_PERCENT_CAP: u8 = 95;

/// One flushed progress block, reduced to the fields the service uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressRecord {
    /// Elapsed media time in seconds.
    pub out_time_secs: Option<f64>,
    /// Cumulative bytes written by the worker.
    pub total_bytes: Option<u64>,
    /// Frames processed so far.
    pub frame: Option<u64>,
    /// Whether this was the final `progress=end` block.
    pub end: bool,
}

/// Stateful `key=value` block parser.
///
/// Feed complete lines; a record is returned on each `progress=` terminator
/// and the accumulator resets, so fields missing from the next block read as
/// `None` instead of going stale.
#[derive(Debug, Default)]
pub struct ProgressParser {
    out_time_secs: Option<f64>,
    total_bytes: Option<u64>,
    frame: Option<u64>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume one line; returns a record when the line closes a block.
    ///
    /// Unknown keys, malformed values, and lines without `=` are ignored;
    /// the worker interleaves its progress stream with nothing else on this
    /// pipe but tolerating noise costs nothing.
    pub fn feed_line(&mut self, line: &str) -> Option<ProgressRecord> {
        let (key, value) = line.trim().split_once('=')?;
        let key = key.trim();
        let value = value.trim();

        match key {
            // out_time_ms carries microseconds too, a long-standing worker
            // quirk; both keys are interchangeable.
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<u64>() {
                    self.out_time_secs = Some(us as f64 / 1_000_000.0);
                }
            }
            "out_time" => {
                if self.out_time_secs.is_none() {
                    self.out_time_secs = parse_clock_time(value);
                }
            }
            "total_size" => {
                self.total_bytes = value.parse::<u64>().ok();
            }
            "frame" => {
                self.frame = value.parse::<u64>().ok();
            }
            "progress" => {
                return Some(ProgressRecord {
                    out_time_secs: self.out_time_secs.take(),
                    total_bytes: self.total_bytes.take(),
                    frame: self.frame.take(),
                    end: value == "end",
                });
            }
            _ => {}
        }
        None
    }
}

/// Parse a `HH:MM:SS.frac` clock time to seconds.
fn parse_clock_time(time_str: &str) -> Option<f64> {
    let parts: Vec<&str> = time_str.split(':').collect();
    if parts.len() != 3 {
        return None;
    }

    let hours: f64 = parts[0].parse().ok()?;
    let minutes: f64 = parts[1].parse().ok()?;
    let seconds: f64 = parts[2].parse().ok()?;

    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Fold one progress record into a task's metrics.
///
/// Percent is duration-based when the playlist gave us a total duration,
/// frame-based (capped at [`FALLBACK_PERCENT_CAP`]) otherwise, and clamped
/// monotonically so observers never see it regress. Speed comes from the
/// byte delta over the wall-clock delta, skipped when the clock or the byte
/// counter did not move forward.
pub(crate) fn apply_record(task: &mut DownloadTask, record: &ProgressRecord, now: DateTime<Utc>) {
    let percent = if task.total_duration_secs > 0.0 {
        record
            .out_time_secs
            .map(|elapsed| ((elapsed / task.total_duration_secs) * 100.0).round().clamp(0.0, 100.0) as u8)
    } else {
        None
    };
    let percent = percent.or_else(|| {
        record
            .frame
            .map(|frame| (frame / FALLBACK_FRAMES_PER_PERCENT).min(FALLBACK_PERCENT_CAP as u64) as u8)
    });
    if let Some(percent) = percent {
        task.progress_percent = task.progress_percent.max(percent);
    }

    if let Some(bytes) = record.total_bytes {
        let elapsed_ms = task
            .last_update_at
            .or(task.started_at)
            .map(|since| (now - since).num_milliseconds())
            .unwrap_or(0);
        if elapsed_ms > 0 && bytes >= task.last_downloaded_bytes {
            let delta = bytes - task.last_downloaded_bytes;
            task.speed_bytes_per_sec = delta.saturating_mul(1000) / elapsed_ms as u64;
        }
        task.downloaded_bytes = bytes;
        task.last_downloaded_bytes = bytes;

        if task.progress_percent > 0 {
            task.total_bytes_estimate = bytes.saturating_mul(100) / u64::from(task.progress_percent);
        }
        task.eta_secs = if task.speed_bytes_per_sec > 0 && task.total_bytes_estimate > bytes {
            (task.total_bytes_estimate - bytes) / task.speed_bytes_per_sec
        } else {
            0
        };
    }

    if task.total_segments > 0 {
        task.downloaded_segments =
            (task.total_segments * u64::from(task.progress_percent) / 100).min(task.total_segments);
    }

    task.last_update_at = Some(now);
}
