//! Bounded MPSC job queue with drop-oldest-on-overflow semantics (§4.8).
//!
//! `tokio::sync::mpsc`'s bounded channel rejects the newest item when full,
//! which is the wrong overflow policy here: the spec wants the *oldest*
//! queued job evicted (and counted) so the queue always holds the freshest
//! work. A plain channel can't express that, so the queue is a
//! `Mutex<VecDeque>` paired with a `Notify` for wakeups.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Notify};
use tracing::error;

use crate::models::ScanJob;

pub struct JobQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<ScanJob>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        JobQueue {
            capacity: capacity.max(1),
            jobs: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes a job, evicting the oldest queued job if the queue is already
    /// at capacity. The eviction is logged as an error and counted (§4.8).
    pub async fn push(&self, job: ScanJob) {
        let mut jobs = self.jobs.lock().await;
        if jobs.len() >= self.capacity {
            if let Some(evicted) = jobs.pop_front() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!(path = %evicted.path, "job queue full, dropping oldest job");
            }
        }
        jobs.push_back(job);
        drop(jobs);
        self.notify.notify_one();
    }

    /// Pops the oldest job, waiting up to `timeout` for one to arrive. Returns
    /// `None` on timeout so the worker loop can re-check its shutdown flag.
    pub async fn pop(&self, timeout: std::time::Duration) -> Option<ScanJob> {
        loop {
            {
                let mut jobs = self.jobs.lock().await;
                if let Some(job) = jobs.pop_front() {
                    return Some(job);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(timeout) => return None,
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pop_returns_none_on_timeout_when_empty() {
        let q = JobQueue::new(4);
        let job = q.pop(Duration::from_millis(20)).await;
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn push_then_pop_round_trips_fifo() {
        let q = JobQueue::new(4);
        q.push(ScanJob::scan_file("/tmp/a", None)).await;
        q.push(ScanJob::scan_file("/tmp/b", None)).await;
        let first = q.pop(Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.path, "/tmp/a");
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts_it() {
        let q = JobQueue::new(2);
        q.push(ScanJob::scan_file("/tmp/a", None)).await;
        q.push(ScanJob::scan_file("/tmp/b", None)).await;
        q.push(ScanJob::scan_file("/tmp/c", None)).await;

        assert_eq!(q.dropped_count(), 1);
        assert_eq!(q.len().await, 2);
        let first = q.pop(Duration::from_millis(20)).await.unwrap();
        assert_eq!(first.path, "/tmp/b");
    }
}
