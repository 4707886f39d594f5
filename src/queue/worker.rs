//! Scan worker pool (C9): N tasks draining the job queue, each running the
//! detection pipeline end to end and publishing its outcome.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::event_bus::EventBus;
use crate::models::{Event, EventType, JobType, ScanJob};
use crate::pipeline::DetectionPipeline;

const POLL_TIMEOUT: Duration = Duration::from_millis(500);
const STABILITY_READ_INTERVAL: Duration = Duration::from_millis(800);
const STABILITY_MAX_TRIES: u32 = 3;

use super::JobQueue;

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerPool {
    /// Spawns `worker_count` worker tasks, each draining `queue` independently.
    pub fn spawn(
        worker_count: usize,
        queue: Arc<JobQueue>,
        pipeline: Arc<DetectionPipeline>,
        events: Arc<EventBus>,
    ) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(worker_count);

        for id in 0..worker_count.max(1) {
            let queue = queue.clone();
            let pipeline = pipeline.clone();
            let events = events.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                run_worker(id, queue, pipeline, events, shutdown).await;
            }));
        }

        WorkerPool { handles, shutdown }
    }

    /// Signals every worker to stop after its current job and waits for them
    /// to drain. Cancellation is cooperative: the flag is only checked
    /// between jobs, never mid-scan.
    pub async fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<JobQueue>,
    pipeline: Arc<DetectionPipeline>,
    events: Arc<EventBus>,
    shutdown: Arc<AtomicBool>,
) {
    info!(worker_id = id, "scan worker started");

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let Some(job) = queue.pop(POLL_TIMEOUT).await else {
            continue;
        };

        match job.job_type {
            JobType::ScanFile => process_scan_job(id, &job, &pipeline, &events).await,
        }
    }

    info!(worker_id = id, "scan worker stopped");
}

async fn process_scan_job(worker_id: usize, job: &ScanJob, pipeline: &DetectionPipeline, events: &EventBus) {
    let path = Path::new(&job.path);

    match path.metadata() {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => {
            publish_scan_error(events, &job.path, "path is not a regular file").await;
            return;
        }
        Err(e) => {
            publish_scan_error(events, &job.path, &format!("path does not exist: {e}")).await;
            return;
        }
    }

    if !wait_for_stable_size(path).await {
        warn!(worker_id, path = %job.path, "file never stabilized, skipping scan");
        publish_scan_error(events, &job.path, "file size did not stabilize").await;
        return;
    }

    match pipeline.scan(path, job.source.clone()).await {
        Ok(result) => {
            debug!(worker_id, path = %job.path, severity = %result.severity, "scan completed");
        }
        Err(e) => {
            error!(worker_id, path = %job.path, error = %e, "scan failed");
            publish_scan_error(events, &job.path, &e.to_string()).await;
        }
    }
}

/// Reads the file size three times, 0.8s apart, proceeding only if the last
/// two reads agree. Guards against scanning a file mid-write.
async fn wait_for_stable_size(path: &Path) -> bool {
    let mut reads = Vec::with_capacity(STABILITY_MAX_TRIES as usize);
    for attempt in 0..STABILITY_MAX_TRIES {
        let size = match tokio::fs::metadata(path).await {
            Ok(meta) => meta.len(),
            Err(_) => return false,
        };
        reads.push(size);
        if attempt + 1 < STABILITY_MAX_TRIES {
            tokio::time::sleep(STABILITY_READ_INTERVAL).await;
        }
    }
    reads.windows(2).last().map(|w| w[0] == w[1]).unwrap_or(false)
}

async fn publish_scan_error(events: &EventBus, path: &str, error: &str) {
    events
        .publish(Event::new(
            EventType::ScanError,
            serde_json::json!({ "path": path, "error": error }),
        ))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stable_file_passes_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stable.bin");
        std::fs::write(&path, b"hello").unwrap();
        assert!(wait_for_stable_size(&path).await);
    }

    #[tokio::test]
    async fn missing_file_fails_the_gate() {
        let path = std::path::Path::new("/nonexistent/path/to/file.bin");
        assert!(!wait_for_stable_size(path).await);
    }
}
