//! Download orchestration service.
//!
//! [`DownloadService`] is the single entry point: it owns the task registry,
//! the admission pool, the worker supervisor, and the event bus, and every
//! operation that used to be scattered over process-wide singletons hangs
//! off one explicitly constructed value. The service is a cheap handle;
//! clones share the same state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use playlist::{HttpPlaylistResolver, PlaylistResolver};

use crate::config::ServiceConfig;
use crate::error::{Error, Result};
use crate::events::{DownloadEvent, EventBus};
use crate::input::BatchItem;
use crate::pool::{DownloadPool, QueueEntry};
use crate::registry::TaskRegistry;
use crate::supervisor::{
    FfmpegLauncher, Supervisor, WorkerEvent, WorkerHandle, WorkerLauncher, WorkerOutcome,
    WorkerRequest, apply_record,
};
use crate::task::{DownloadTask, TaskStatus};

/// Per-call options for [`DownloadService::download`] and
/// [`DownloadService::download_batch`].
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Adjust the concurrency limit before enqueueing. Out-of-range values
    /// are ignored, same as [`DownloadService::set_max_concurrent`].
    pub max_concurrent: Option<usize>,
}

impl DownloadOptions {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = Some(max);
        self
    }
}

/// Point-in-time service counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ServiceStats {
    pub total_tasks: usize,
    pub queued: usize,
    pub active: usize,
    pub max_concurrent: usize,
}

struct Inner {
    registry: TaskRegistry,
    pool: DownloadPool,
    events: EventBus,
    supervisor: Supervisor,
    resolver: Arc<dyn PlaylistResolver>,
    /// Cancellation token per running worker, used by cancel/clear/shutdown.
    active_tokens: DashMap<String, CancellationToken>,
    settle_delay: Duration,
    shutdown: CancellationToken,
    /// Admission loop, worker pumps, resolution probes and settle timers.
    /// Tasks spawned from tracked tasks extend the shutdown wait, so a pump
    /// spawned mid-admission is still awaited.
    runners: TaskTracker,
    started: AtomicBool,
}

/// Builder for [`DownloadService`], used to inject alternative resolver or
/// launcher implementations.
pub struct DownloadServiceBuilder {
    config: ServiceConfig,
    resolver: Option<Arc<dyn PlaylistResolver>>,
    launcher: Option<Arc<dyn WorkerLauncher>>,
}

impl DownloadServiceBuilder {
    pub fn config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn PlaylistResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn build(self) -> DownloadService {
        let config = self.config;
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(FfmpegLauncher::with_config(config.worker.clone())));
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(HttpPlaylistResolver::new()));

        DownloadService {
            inner: Arc::new(Inner {
                registry: TaskRegistry::new(),
                pool: DownloadPool::new(config.max_concurrent),
                events: EventBus::with_capacity(config.event_capacity),
                supervisor: Supervisor::new(launcher, &config.worker),
                resolver,
                active_tokens: DashMap::new(),
                settle_delay: Duration::from_millis(config.settle_delay_ms),
                shutdown: CancellationToken::new(),
                runners: TaskTracker::new(),
                started: AtomicBool::new(false),
            }),
        }
    }
}

/// Orchestrates segmented-media downloads through worker subprocesses.
#[derive(Clone)]
pub struct DownloadService {
    inner: Arc<Inner>,
}

impl DownloadService {
    /// Create a service with default configuration.
    pub fn new() -> Self {
        Self::with_config(ServiceConfig::default())
    }

    /// Create with a custom configuration.
    pub fn with_config(config: ServiceConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> DownloadServiceBuilder {
        DownloadServiceBuilder {
            config: ServiceConfig::default(),
            resolver: None,
            launcher: None,
        }
    }

    /// Spawn the admission loop. Idempotent; tasks enqueued before `start`
    /// are admitted once it runs.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.inner.supervisor.is_available() {
            warn!("worker binary unavailable; downloads will fail at spawn");
        } else if let Some(version) = self.inner.supervisor.version() {
            debug!(%version, "worker binary detected");
        }
        let service = self.clone();
        self.spawn(async move { service.admission_loop().await });
    }

    /// Stop the admission loop, cancel every running worker, and wait for
    /// all background tasks to finish. Every worker that was already
    /// admitted is finalized as Cancelled before this returns.
    pub async fn shutdown(&self) {
        info!("shutting down download service");
        self.inner.shutdown.cancel();
        for entry in self.inner.active_tokens.iter() {
            entry.value().cancel();
        }
        self.inner.runners.close();
        self.inner.runners.wait().await;
    }

    /// Queue a single download and return its task id immediately.
    ///
    /// The id comes back before any transfer starts; admission, playlist
    /// resolution and the worker all proceed in the background. Only the
    /// URL shape is validated here.
    pub fn download(
        &self,
        url: &str,
        output_dir: impl Into<PathBuf>,
        file_name: impl Into<String>,
        options: DownloadOptions,
    ) -> Result<String> {
        if !is_supported_url(url) {
            return Err(Error::invalid_url(url));
        }
        if let Some(max) = options.max_concurrent {
            self.set_max_concurrent(max);
        }
        Ok(self.enqueue(url.to_string(), output_dir.into(), file_name.into(), 0))
    }

    /// Queue a batch of downloads into one output directory.
    ///
    /// Malformed URLs are skipped with a warning; the returned ids match the
    /// retained items positionally. Enqueue order is admission order.
    pub fn download_batch(
        &self,
        items: Vec<BatchItem>,
        output_dir: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Vec<String> {
        if let Some(max) = options.max_concurrent {
            self.set_max_concurrent(max);
        }
        let output_dir = output_dir.into();
        let mut task_ids = Vec::new();
        for item in items {
            if !is_supported_url(&item.url) {
                warn!(url = %item.url, "skipping malformed URL in batch");
                continue;
            }
            task_ids.push(self.enqueue(item.url, output_dir.clone(), item.file_name, 0));
        }
        task_ids
    }

    /// Snapshots of all tasks, oldest first.
    pub fn tasks(&self) -> Vec<DownloadTask> {
        self.inner.registry.list()
    }

    /// Snapshot of one task.
    pub fn task(&self, task_id: &str) -> Option<DownloadTask> {
        self.inner.registry.get(task_id)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    /// Mark a running task paused.
    ///
    /// Pause is bookkeeping: the worker keeps transferring and metrics keep
    /// updating, only the presented state changes. A true suspend would need
    /// worker teardown and byte-range resume, which the worker cannot do
    /// mid-file. Returns `false` unless the task was Downloading.
    pub fn pause(&self, task_id: &str) -> bool {
        match self.inner.registry.transition(task_id, TaskStatus::Paused) {
            Some(task) => {
                info!(task_id = %task_id, "task paused");
                self.inner.events.publish(DownloadEvent::Paused { task });
                true
            }
            None => false,
        }
    }

    /// Mark a paused task downloading again. Returns `false` unless the task
    /// was Paused.
    pub fn resume(&self, task_id: &str) -> bool {
        // Waiting -> Downloading is reserved for admission; an unchecked
        // transition here would mark a queued task running with no worker.
        let resumed = self.inner.registry.transition_from(
            task_id,
            TaskStatus::Paused,
            TaskStatus::Downloading,
        );
        match resumed {
            Some(task) => {
                info!(task_id = %task_id, "task resumed");
                self.inner.events.publish(DownloadEvent::Resumed { task });
                true
            }
            None => false,
        }
    }

    /// Cancel a waiting or running task.
    ///
    /// Waiting tasks drop their queue ticket and finalize immediately.
    /// Running tasks have their worker killed; the Cancelled state lands
    /// once the process has been reaped, so a `true` here means "cancel is
    /// underway", not "already cancelled". Repeat calls and terminal tasks
    /// return `false`.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Some(task) = self.inner.registry.get(task_id) else {
            return false;
        };
        match task.status {
            TaskStatus::Waiting => {
                // Only finalize here while we hold the queue ticket. If the
                // admission loop already took it, the worker path owns the
                // task and cancellation goes through its token.
                if self.inner.pool.remove_queued(task_id) {
                    match self.inner.registry.transition(task_id, TaskStatus::Cancelled) {
                        Some(task) => {
                            info!(task_id = %task_id, "cancelled queued task");
                            self.inner.events.publish(DownloadEvent::Cancelled { task });
                            true
                        }
                        None => false,
                    }
                } else {
                    self.signal_cancel(task_id)
                }
            }
            TaskStatus::Downloading | TaskStatus::Paused => self.signal_cancel(task_id),
            _ => false,
        }
    }

    fn signal_cancel(&self, task_id: &str) -> bool {
        match self.inner.active_tokens.get(task_id) {
            Some(token) if !token.is_cancelled() => {
                info!(task_id = %task_id, "cancellation signalled");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Re-queue a failed task as a fresh one.
    ///
    /// Returns the new task id, or `None` when the task is unknown or not
    /// Failed. The failed record stays in the registry; lineage is carried
    /// in the new task's `retry_count`.
    pub fn retry(&self, task_id: &str) -> Option<String> {
        let task = self.inner.registry.get(task_id)?;
        if task.status != TaskStatus::Failed {
            return None;
        }
        info!(task_id = %task_id, retry_count = task.retry_count + 1, "retrying failed task");
        Some(self.enqueue(
            task.url,
            task.output_dir,
            task.file_name,
            task.retry_count + 1,
        ))
    }

    /// Remove tasks from the registry, cancelling any that are still live.
    ///
    /// Returns `true` iff every id was found; unknown ids flip the result
    /// but do not stop the sweep.
    pub fn clear(&self, task_ids: &[String]) -> bool {
        let mut all_found = true;
        for task_id in task_ids {
            let Some(task) = self.inner.registry.get(task_id) else {
                all_found = false;
                continue;
            };
            if !task.is_terminal() {
                self.inner.pool.remove_queued(task_id);
                if let Some(token) = self.inner.active_tokens.get(task_id) {
                    token.cancel();
                }
            }
            self.inner.registry.remove(task_id);
            info!(task_id = %task_id, "task removed");
            self.inner
                .events
                .publish(DownloadEvent::Removed {
                    task_id: task_id.clone(),
                });
        }
        all_found
    }

    /// Update the concurrency limit; out-of-range values are ignored and
    /// accepted ones immediately wake the admission loop.
    pub fn set_max_concurrent(&self, max: usize) {
        self.inner.pool.set_max_concurrent(max);
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            total_tasks: self.inner.registry.len(),
            queued: self.inner.pool.queued_len(),
            active: self.inner.pool.active_len(),
            max_concurrent: self.inner.pool.max_concurrent(),
        }
    }

    /// Whether the worker binary answered a version probe at construction.
    pub fn worker_available(&self) -> bool {
        self.inner.supervisor.is_available()
    }

    /// Version banner of the worker binary, when it could be probed.
    pub fn worker_version(&self) -> Option<String> {
        self.inner.supervisor.version()
    }

    // Internals ------------------------------------------------------------

    /// Spawn a background task into the shutdown-awaited tracker.
    fn spawn(&self, future: impl Future<Output = ()> + Send + 'static) {
        self.inner.runners.spawn(future);
    }

    /// Register the task, publish `Created`, kick off playlist resolution,
    /// and push the admission ticket. Push order is admission order.
    fn enqueue(
        &self,
        url: String,
        output_dir: PathBuf,
        file_name: String,
        retry_count: u32,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let mut task = DownloadTask::new(task_id.clone(), url.clone(), output_dir.clone(), file_name.clone());
        task.retry_count = retry_count;

        self.inner.registry.insert(task.clone());
        info!(task_id = %task_id, url = %url, "task created");
        self.inner.events.publish(DownloadEvent::Created { task });

        self.spawn_resolution(task_id.clone(), url.clone());

        self.inner.pool.push(QueueEntry {
            request: WorkerRequest {
                task_id: task_id.clone(),
                url,
                output_dir,
                file_name,
            },
        });

        task_id
    }

    /// Probe the playlist concurrently with queueing. On success the totals
    /// are merged into the task and `Updated` is published; failure just
    /// leaves the counters at zero, it never fails the download.
    fn spawn_resolution(&self, task_id: String, url: String) {
        let service = self.clone();
        self.spawn(async move {
            match service.inner.resolver.probe(&url).await {
                Ok(summary) => {
                    let snapshot = service.inner.registry.update(&task_id, |task| {
                        if !task.is_terminal() {
                            task.total_segments = summary.segment_count;
                            task.total_duration_secs = summary.total_duration_secs;
                        }
                    });
                    if let Some(task) = snapshot {
                        if !task.is_terminal() {
                            debug!(
                                task_id = %task_id,
                                segments = summary.segment_count,
                                duration_secs = summary.total_duration_secs,
                                "playlist resolved"
                            );
                            service.inner.events.publish(DownloadEvent::Updated { task });
                        }
                    }
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "playlist resolution failed");
                }
            }
        });
    }

    async fn admission_loop(&self) {
        debug!("admission loop started");
        loop {
            self.drain_admissions().await;
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = self.inner.pool.notified() => {}
            }
        }
        debug!("admission loop stopped");
    }

    async fn drain_admissions(&self) {
        while let Some(entry) = self.inner.pool.try_admit() {
            self.admit(entry).await;
        }
    }

    async fn admit(&self, entry: QueueEntry) {
        let request = entry.request;
        let task_id = request.task_id.clone();

        let token = CancellationToken::new();
        self.inner.active_tokens.insert(task_id.clone(), token.clone());

        let output_path = request.output_path();
        let snapshot = self
            .inner
            .registry
            .transition_with(&task_id, TaskStatus::Downloading, |task| {
                task.started_at = Some(Utc::now());
                task.output_path = Some(output_path.clone());
            });
        let Some(snapshot) = snapshot else {
            // Cancelled or removed while the ticket was in flight.
            debug!(task_id = %task_id, "dropping admission for task no longer waiting");
            self.inner.active_tokens.remove(&task_id);
            self.inner.pool.release();
            return;
        };

        info!(task_id = %task_id, url = %request.url, "starting download");
        self.inner.events.publish(DownloadEvent::Started { task: snapshot });

        match self.inner.supervisor.start(request, token).await {
            Ok(handle) => {
                let service = self.clone();
                self.spawn(async move { service.pump_worker(handle).await });
            }
            Err(e) => {
                warn!(task_id = %task_id, error = %e, "failed to start worker");
                self.inner.active_tokens.remove(&task_id);
                self.finalize(
                    &task_id,
                    WorkerOutcome::Failed {
                        exit_code: None,
                        message: format!("failed to start worker: {e}"),
                    },
                )
                .await;
            }
        }
    }

    /// Drive one worker's event stream to completion.
    async fn pump_worker(&self, mut handle: WorkerHandle) {
        let task_id = handle.task_id.clone();
        while let Some(event) = handle.events.recv().await {
            match event {
                WorkerEvent::Progress(record) => {
                    let now = Utc::now();
                    let snapshot = self.inner.registry.update(&task_id, |task| {
                        if !task.is_terminal() {
                            apply_record(task, &record, now);
                        }
                    });
                    // Late samples racing a cancel or clear are dropped.
                    if let Some(task) = snapshot {
                        if !task.is_terminal() {
                            self.inner.events.publish(DownloadEvent::Progress { task });
                        }
                    }
                }
                WorkerEvent::Finished(outcome) => {
                    self.inner.active_tokens.remove(&task_id);
                    self.finalize(&task_id, outcome).await;
                }
            }
        }
    }

    /// Fold the terminal worker outcome into the registry, publish the
    /// terminal event, and free the slot.
    async fn finalize(&self, task_id: &str, outcome: WorkerOutcome) {
        match outcome {
            WorkerOutcome::Completed => {
                let snapshot = self
                    .inner
                    .registry
                    .transition_with(task_id, TaskStatus::Completed, |task| {
                        task.progress_percent = 100;
                        task.downloaded_segments = task.total_segments;
                        task.speed_bytes_per_sec = 0;
                        task.eta_secs = 0;
                        task.last_update_at = Some(Utc::now());
                    });
                if let Some(task) = snapshot {
                    info!(task_id = %task_id, bytes = task.downloaded_bytes, "download completed");
                    self.inner.events.publish(DownloadEvent::Completed { task });
                }
            }
            WorkerOutcome::Failed { exit_code, message } => {
                let snapshot = self
                    .inner
                    .registry
                    .transition_with(task_id, TaskStatus::Failed, |task| {
                        task.error_message = Some(message.clone());
                        task.speed_bytes_per_sec = 0;
                        task.eta_secs = 0;
                    });
                if let Some(task) = snapshot {
                    warn!(task_id = %task_id, exit_code = ?exit_code, "download failed");
                    self.inner.events.publish(DownloadEvent::Failed { task });
                }
            }
            WorkerOutcome::Cancelled => {
                let snapshot = self.inner.registry.transition(task_id, TaskStatus::Cancelled);
                if let Some(task) = snapshot {
                    if let Some(path) = &task.output_path {
                        match tokio::fs::remove_file(path).await {
                            Ok(()) => {
                                debug!(task_id = %task_id, path = %path.display(), "removed partial output");
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                            Err(e) => {
                                warn!(task_id = %task_id, error = %e, "failed to remove partial output");
                            }
                        }
                    }
                    info!(task_id = %task_id, "download cancelled");
                    self.inner.events.publish(DownloadEvent::Cancelled { task });
                }
            }
        }

        self.inner.pool.release();
        let service = self.clone();
        self.spawn(async move {
            tokio::time::sleep(service.inner.settle_delay).await;
            service.inner.pool.notify();
        });
    }
}

impl Default for DownloadService {
    fn default() -> Self {
        Self::new()
    }
}

fn is_supported_url(url: &str) -> bool {
    matches!(Url::parse(url), Ok(parsed) if matches!(parsed.scheme(), "http" | "https"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> DownloadService {
        // Admission loop not started; tasks stay Waiting.
        DownloadService::with_config(ServiceConfig::default())
    }

    #[tokio::test]
    async fn test_download_returns_id_and_queues() {
        let service = service();
        let mut rx = service.subscribe();

        let id = service
            .download("https://example.com/v.m3u8", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap();

        let task = service.task(&id).unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.file_name, "v.mp4");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "created");
        assert_eq!(event.task_id(), id);

        let stats = service.stats();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.queued, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_download_rejects_malformed_url() {
        let service = service();
        let err = service
            .download("not a url", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));

        let err = service
            .download("ftp://example.com/v.m3u8", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }

    #[tokio::test]
    async fn test_batch_filters_malformed_urls() {
        let service = service();
        let items = vec![
            BatchItem {
                url: "https://example.com/a.m3u8".to_string(),
                file_name: "a.mp4".to_string(),
            },
            BatchItem {
                url: "nope".to_string(),
                file_name: "b.mp4".to_string(),
            },
            BatchItem {
                url: "https://example.com/c.m3u8".to_string(),
                file_name: "c.mp4".to_string(),
            },
        ];

        let ids = service.download_batch(items, "/tmp/dl", DownloadOptions::default());
        assert_eq!(ids.len(), 2);
        assert_eq!(service.task(&ids[0]).unwrap().file_name, "a.mp4");
        assert_eq!(service.task(&ids[1]).unwrap().file_name, "c.mp4");
    }

    #[tokio::test]
    async fn test_cancel_waiting_task() {
        let service = service();
        let id = service
            .download("https://example.com/v.m3u8", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap();

        assert!(service.cancel(&id));
        assert_eq!(service.task(&id).unwrap().status, TaskStatus::Cancelled);
        assert_eq!(service.stats().queued, 0);

        // Terminal now; a second cancel is a no-op.
        assert!(!service.cancel(&id));
    }

    #[tokio::test]
    async fn test_retry_requires_failed() {
        let service = service();
        let id = service
            .download("https://example.com/v.m3u8", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap();

        assert!(service.retry(&id).is_none());
        assert!(service.retry("unknown").is_none());
    }

    #[tokio::test]
    async fn test_clear_reports_unknown_ids() {
        let service = service();
        let id = service
            .download("https://example.com/v.m3u8", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap();

        assert!(!service.clear(&[id.clone(), "unknown".to_string()]));
        assert!(service.task(&id).is_none());
        assert!(service.clear(&[]));
    }

    #[tokio::test]
    async fn test_options_adjust_limit_with_validation() {
        let service = service();
        assert_eq!(service.stats().max_concurrent, 3);

        service
            .download(
                "https://example.com/v.m3u8",
                "/tmp/dl",
                "v.mp4",
                DownloadOptions::default().with_max_concurrent(7),
            )
            .unwrap();
        assert_eq!(service.stats().max_concurrent, 7);

        service.set_max_concurrent(0);
        assert_eq!(service.stats().max_concurrent, 7);
        service.set_max_concurrent(11);
        assert_eq!(service.stats().max_concurrent, 7);
    }

    #[tokio::test]
    async fn test_pause_only_from_downloading() {
        let service = service();
        let id = service
            .download("https://example.com/v.m3u8", "/tmp/dl", "v.mp4", DownloadOptions::default())
            .unwrap();

        // Still waiting, so neither pause nor resume applies.
        assert!(!service.pause(&id));
        assert!(!service.resume(&id));

        // The refused resume must not consume the Waiting state; the queued
        // ticket still admits this task later.
        assert_eq!(service.task(&id).unwrap().status, TaskStatus::Waiting);
        assert_eq!(service.stats().queued, 1);
    }
}
