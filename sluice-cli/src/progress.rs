// Terminal progress rendering driven by service events.

use std::collections::HashMap;
use std::time::Duration;

use indicatif::{HumanBytes, HumanDuration, MultiProgress, ProgressBar, ProgressStyle};
use sluice::DownloadEvent;
use tokio::sync::broadcast;

/// One progress bar per task, fed from the event stream.
pub struct ProgressRenderer {
    multi: MultiProgress,
    bars: HashMap<String, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressRenderer {
    pub fn new() -> Self {
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{wide_bar:.cyan/blue}] {pos:>3}% {msg}")
            .unwrap()
            .progress_chars("=> ");
        Self {
            multi: MultiProgress::new(),
            bars: HashMap::new(),
            style,
        }
    }

    /// Consume events until the bus closes. Lagging only skips frames; the
    /// next snapshot repaints the bar.
    pub async fn run(mut self, mut rx: broadcast::Receiver<DownloadEvent>) {
        loop {
            match rx.recv().await {
                Ok(event) => self.apply(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    fn apply(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::Created { task } => {
                let bar = self.multi.add(ProgressBar::new(100));
                bar.set_style(self.style.clone());
                bar.enable_steady_tick(Duration::from_millis(120));
                bar.set_message(task.file_name.clone());
                self.bars.insert(task.id, bar);
            }
            DownloadEvent::Progress { task } | DownloadEvent::Updated { task } => {
                if let Some(bar) = self.bars.get(&task.id) {
                    bar.set_position(u64::from(task.progress_percent));
                    bar.set_message(format!(
                        "{}  {}/s  eta {}",
                        task.file_name,
                        HumanBytes(task.speed_bytes_per_sec),
                        HumanDuration(Duration::from_secs(task.eta_secs))
                    ));
                }
            }
            DownloadEvent::Paused { task } => {
                if let Some(bar) = self.bars.get(&task.id) {
                    bar.set_message(format!("{}  paused", task.file_name));
                }
            }
            DownloadEvent::Resumed { task } => {
                if let Some(bar) = self.bars.get(&task.id) {
                    bar.set_message(task.file_name);
                }
            }
            DownloadEvent::Completed { task } => {
                if let Some(bar) = self.bars.get(&task.id) {
                    bar.set_position(100);
                    bar.finish_with_message(format!(
                        "{}  done ({})",
                        task.file_name,
                        HumanBytes(task.downloaded_bytes)
                    ));
                }
            }
            DownloadEvent::Failed { task } => {
                if let Some(bar) = self.bars.get(&task.id) {
                    let reason = task.error_message.as_deref().unwrap_or("unknown error");
                    bar.abandon_with_message(format!("{}  failed: {reason}", task.file_name));
                }
            }
            DownloadEvent::Cancelled { task } => {
                if let Some(bar) = self.bars.get(&task.id) {
                    bar.abandon_with_message(format!("{}  cancelled", task.file_name));
                }
            }
            DownloadEvent::Started { .. } | DownloadEvent::Removed { .. } => {}
        }
    }
}

impl Default for ProgressRenderer {
    fn default() -> Self {
        Self::new()
    }
}
