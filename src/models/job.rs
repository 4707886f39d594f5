use serde::{Deserialize, Serialize};

/// A unit of work pushed onto the job queue. The watcher, the fast-event
/// ingestor, and a server-side directory walk are all producers; the worker
/// pool is the sole consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub job_type: JobType,
    pub path: String,
    pub ts: f64,
    /// Device/agent descriptor that triggered this job, when known (fast-event path).
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ScanFile,
}

impl ScanJob {
    pub fn scan_file(path: impl Into<String>, source: Option<String>) -> Self {
        ScanJob {
            job_type: JobType::ScanFile,
            path: path.into(),
            ts: now_secs(),
            source,
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
