//! FIFO admission control for worker slots.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use crate::supervisor::WorkerRequest;

/// Lower bound for the concurrency limit.
pub const MIN_CONCURRENT: usize = 1;

/// Upper bound for the concurrency limit.
pub const MAX_CONCURRENT: usize = 10;

/// Concurrency limit used when none is configured.
pub const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Delay after a worker finishes before the next admission round, in
/// milliseconds. Batches bursts of completions into one queue scan.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 250;

/// Admission ticket for one queued task. Owned by the pool until admission,
/// then handed to the supervisor and dropped.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub request: WorkerRequest,
}

impl QueueEntry {
    pub fn task_id(&self) -> &str {
        &self.request.task_id
    }
}

struct PoolState {
    queue: VecDeque<QueueEntry>,
    active: usize,
    max_concurrent: usize,
}

/// Waiting queue plus the running-worker counter, under a single lock so a
/// pop and its slot reservation are one atomic step.
///
/// The pool does not run anything itself; the service's admission loop waits
/// on [`Self::notified`] and drains [`Self::try_admit`].
pub struct DownloadPool {
    state: Mutex<PoolState>,
    notify: Notify,
}

impl DownloadPool {
    /// Create a pool with the given concurrency limit. Out-of-range limits
    /// fall back to [`DEFAULT_MAX_CONCURRENT`].
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = if (MIN_CONCURRENT..=MAX_CONCURRENT).contains(&max_concurrent) {
            max_concurrent
        } else {
            debug!(
                requested = max_concurrent,
                fallback = DEFAULT_MAX_CONCURRENT,
                "concurrency limit out of range, using default"
            );
            DEFAULT_MAX_CONCURRENT
        };
        Self {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                active: 0,
                max_concurrent,
            }),
            notify: Notify::new(),
        }
    }

    /// Append an admission ticket. Never blocks, never depends on capacity;
    /// push order is admission order.
    pub fn push(&self, entry: QueueEntry) {
        self.state.lock().queue.push_back(entry);
        self.notify.notify_one();
    }

    /// Pop the oldest ticket if a slot is free, reserving the slot in the
    /// same critical section.
    pub fn try_admit(&self) -> Option<QueueEntry> {
        let mut state = self.state.lock();
        if state.active >= state.max_concurrent {
            return None;
        }
        let entry = state.queue.pop_front()?;
        state.active += 1;
        Some(entry)
    }

    /// Give a slot back after a worker reached a terminal outcome, or after
    /// an admission was rolled back.
    pub fn release(&self) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
    }

    /// Drop a waiting ticket; `false` when the task is not queued (already
    /// admitted or never pushed).
    pub fn remove_queued(&self, task_id: &str) -> bool {
        let mut state = self.state.lock();
        let before = state.queue.len();
        state.queue.retain(|entry| entry.task_id() != task_id);
        state.queue.len() != before
    }

    /// Update the concurrency limit.
    ///
    /// Values outside `1..=10` are logged at debug and ignored; the current
    /// limit stays in effect. Accepted changes wake the admission loop, so
    /// raising the limit admits more tasks immediately. Lowering it never
    /// interrupts running workers, it only throttles future admissions.
    pub fn set_max_concurrent(&self, max: usize) -> bool {
        if !(MIN_CONCURRENT..=MAX_CONCURRENT).contains(&max) {
            debug!(requested = max, "ignoring out-of-range concurrency limit");
            return false;
        }
        self.state.lock().max_concurrent = max;
        self.notify.notify_one();
        true
    }

    /// Wake the admission loop.
    pub fn notify(&self) {
        self.notify.notify_one();
    }

    /// Wait until [`Self::notify`] is called. A wakeup issued while nobody
    /// was waiting is kept and satisfies the next call.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    pub fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn active_len(&self) -> usize {
        self.state.lock().active
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().max_concurrent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(id: &str) -> QueueEntry {
        QueueEntry {
            request: WorkerRequest {
                task_id: id.to_string(),
                url: format!("https://example.com/{id}.m3u8"),
                output_dir: "/tmp/dl".into(),
                file_name: format!("{id}.mp4"),
            },
        }
    }

    #[test]
    fn test_admits_in_fifo_order() {
        let pool = DownloadPool::new(2);
        pool.push(entry("t1"));
        pool.push(entry("t2"));
        pool.push(entry("t3"));

        assert_eq!(pool.try_admit().unwrap().task_id(), "t1");
        assert_eq!(pool.try_admit().unwrap().task_id(), "t2");
        // Both slots taken, t3 has to wait.
        assert!(pool.try_admit().is_none());
        assert_eq!(pool.queued_len(), 1);

        pool.release();
        assert_eq!(pool.try_admit().unwrap().task_id(), "t3");
    }

    #[test]
    fn test_release_below_zero_saturates() {
        let pool = DownloadPool::new(1);
        pool.release();
        assert_eq!(pool.active_len(), 0);
        pool.push(entry("t1"));
        assert!(pool.try_admit().is_some());
    }

    #[test]
    fn test_remove_queued() {
        let pool = DownloadPool::new(1);
        pool.push(entry("t1"));
        pool.push(entry("t2"));

        assert!(pool.remove_queued("t2"));
        assert!(!pool.remove_queued("t2"));
        assert_eq!(pool.queued_len(), 1);

        // Admitted entries are no longer removable.
        let admitted = pool.try_admit().unwrap();
        assert_eq!(admitted.task_id(), "t1");
        assert!(!pool.remove_queued("t1"));
    }

    #[test]
    fn test_set_max_concurrent_bounds() {
        let pool = DownloadPool::new(3);

        assert!(!pool.set_max_concurrent(0));
        assert_eq!(pool.max_concurrent(), 3);
        assert!(!pool.set_max_concurrent(11));
        assert_eq!(pool.max_concurrent(), 3);

        assert!(pool.set_max_concurrent(1));
        assert_eq!(pool.max_concurrent(), 1);
        assert!(pool.set_max_concurrent(10));
        assert_eq!(pool.max_concurrent(), 10);
    }

    #[test]
    fn test_out_of_range_initial_limit_falls_back() {
        assert_eq!(DownloadPool::new(0).max_concurrent(), DEFAULT_MAX_CONCURRENT);
        assert_eq!(DownloadPool::new(99).max_concurrent(), DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn test_lowering_limit_does_not_evict_active() {
        let pool = DownloadPool::new(3);
        for id in ["t1", "t2", "t3"] {
            pool.push(entry(id));
            assert!(pool.try_admit().is_some());
        }
        assert!(pool.set_max_concurrent(1));
        assert_eq!(pool.active_len(), 3);

        // No admissions until the count drops under the new limit.
        pool.push(entry("t4"));
        assert!(pool.try_admit().is_none());
        pool.release();
        pool.release();
        assert!(pool.try_admit().is_none());
        pool.release();
        assert_eq!(pool.try_admit().unwrap().task_id(), "t4");
    }

    #[derive(Debug, Clone)]
    enum PoolOp {
        Push,
        Admit,
        Release,
        SetMax(usize),
    }

    fn pool_op() -> impl Strategy<Value = PoolOp> {
        prop_oneof![
            Just(PoolOp::Push),
            Just(PoolOp::Admit),
            Just(PoolOp::Release),
            (0usize..12).prop_map(PoolOp::SetMax),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_active_never_exceeds_limit(ops in prop::collection::vec(pool_op(), 1..64)) {
            let pool = DownloadPool::new(DEFAULT_MAX_CONCURRENT);
            let mut admitted = 0usize;
            let mut released = 0usize;

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    PoolOp::Push => pool.push(entry(&format!("t{i}"))),
                    PoolOp::Admit => {
                        if pool.try_admit().is_some() {
                            admitted += 1;
                        }
                    }
                    PoolOp::Release => {
                        if released < admitted {
                            pool.release();
                            released += 1;
                        }
                    }
                    PoolOp::SetMax(n) => {
                        let accepted = pool.set_max_concurrent(n);
                        prop_assert_eq!(accepted, (MIN_CONCURRENT..=MAX_CONCURRENT).contains(&n));
                    }
                }
                prop_assert!(pool.active_len() <= MAX_CONCURRENT);
                prop_assert!(pool.max_concurrent() >= MIN_CONCURRENT);
                prop_assert!(pool.max_concurrent() <= MAX_CONCURRENT);
            }
        }
    }
}
