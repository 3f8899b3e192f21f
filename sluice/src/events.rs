//! Task lifecycle events.
//!
//! Every state change in the service is broadcast as a [`DownloadEvent`]
//! carrying a full task snapshot, so subscribers (progress renderers, UI
//! bridges, tests) never have to read the registry to stay current.

use tokio::sync::broadcast;

use crate::task::DownloadTask;

/// Default channel capacity for download events.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events broadcast by the download service.
///
/// Per-task ordering: `Created` comes first; `Started` precedes any
/// `Progress`; exactly one of `Completed` / `Failed` / `Cancelled` ends the
/// stream, after which only `Removed` may follow. Progress snapshots carry
/// non-decreasing percentages.
#[derive(Debug, Clone)]
pub enum DownloadEvent {
    /// A task was registered and queued.
    Created { task: DownloadTask },
    /// Task metadata changed outside the regular progress path, e.g. the
    /// playlist resolution filled in segment totals.
    Updated { task: DownloadTask },
    /// The worker subprocess was launched.
    Started { task: DownloadTask },
    /// A progress flush was parsed from the worker.
    Progress { task: DownloadTask },
    Paused { task: DownloadTask },
    Resumed { task: DownloadTask },
    Completed { task: DownloadTask },
    Failed { task: DownloadTask },
    Cancelled { task: DownloadTask },
    /// The task was removed from the registry.
    Removed { task_id: String },
}

impl DownloadEvent {
    /// Lowercase event name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Updated { .. } => "updated",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Paused { .. } => "paused",
            Self::Resumed { .. } => "resumed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
            Self::Removed { .. } => "removed",
        }
    }

    /// Id of the task the event refers to.
    pub fn task_id(&self) -> &str {
        match self {
            Self::Created { task }
            | Self::Updated { task }
            | Self::Started { task }
            | Self::Progress { task }
            | Self::Paused { task }
            | Self::Resumed { task }
            | Self::Completed { task }
            | Self::Failed { task }
            | Self::Cancelled { task } => &task.id,
            Self::Removed { task_id } => task_id,
        }
    }

    /// The carried snapshot, when the event has one.
    pub fn task(&self) -> Option<&DownloadTask> {
        match self {
            Self::Created { task }
            | Self::Updated { task }
            | Self::Started { task }
            | Self::Progress { task }
            | Self::Paused { task }
            | Self::Resumed { task }
            | Self::Completed { task }
            | Self::Failed { task }
            | Self::Cancelled { task } => Some(task),
            Self::Removed { .. } => None,
        }
    }
}

/// Broadcaster for download events.
///
/// Uses tokio's broadcast channel: publishing never blocks, and slow
/// subscribers lag rather than back-pressuring the service.
pub struct EventBus {
    sender: broadcast::Sender<DownloadEvent>,
}

impl EventBus {
    /// Create a new bus with default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a new bus with specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to download events.
    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.sender.subscribe()
    }

    /// Publish an event.
    ///
    /// Returns the number of receivers that got the event; 0 with no active
    /// subscribers, which is not an error.
    pub fn publish(&self, event: DownloadEvent) -> usize {
        tracing::trace!(kind = event.kind(), task_id = event.task_id(), "publishing event");
        // send() errs when there are no receivers, which is fine
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::DownloadTask;

    fn task(id: &str) -> DownloadTask {
        DownloadTask::new(id, "https://example.com/v.m3u8", "/tmp/dl", "v.mp4")
    }

    #[test]
    fn test_publish_without_subscribers_is_zero() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(DownloadEvent::Created { task: task("a") }), 0);
    }

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let delivered = bus.publish(DownloadEvent::Started { task: task("a") });
        assert_eq!(delivered, 2);

        let ev1 = rx1.recv().await.unwrap();
        let ev2 = rx2.recv().await.unwrap();
        assert_eq!(ev1.kind(), "started");
        assert_eq!(ev2.task_id(), "a");
    }

    #[test]
    fn test_event_accessors() {
        let removed = DownloadEvent::Removed {
            task_id: "gone".to_string(),
        };
        assert_eq!(removed.kind(), "removed");
        assert_eq!(removed.task_id(), "gone");
        assert!(removed.task().is_none());

        let created = DownloadEvent::Created { task: task("a") };
        assert_eq!(created.task().map(|t| t.id.as_str()), Some("a"));
    }
}
