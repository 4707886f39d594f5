//! Core of the hybrid file threat-detection engine: feature extraction,
//! signature matching, anomaly scoring, NLP/phishing analysis, reputation
//! lookup, fusion, persistence, the async scan fabric, and enforcement
//! policy. `main.rs` wires a thin demonstration HTTP surface on top.

pub mod analyzers;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod http;
pub mod ingestor;
pub mod models;
pub mod pipeline;
pub mod policy;
pub mod queue;
pub mod snapshot;
pub mod storage;
pub mod watcher;

use std::sync::Arc;

use tracing::info;

use crate::analyzers::ReputationClient;
use crate::config::Config;
use crate::error::CoreResult;
use crate::event_bus::EventBus;
use crate::ingestor::Ingestor;
use crate::pipeline::DetectionPipeline;
use crate::queue::{JobQueue, WorkerPool};
use crate::storage::Storage;
use crate::watcher::FileWatcher;

/// Everything a demonstration surface (or a test) needs: the shared state
/// wired up once at startup and cloned cheaply via `Arc` per request/task.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub events: Arc<EventBus>,
    pub queue: Arc<JobQueue>,
    pub pipeline: Arc<DetectionPipeline>,
    pub ingestor: Arc<Ingestor>,
}

impl AppContext {
    /// Builds every subsystem from config but does not start the watcher or
    /// the worker pool — call `spawn_background_tasks` for that once the
    /// context is constructed.
    pub async fn build(config: Config) -> CoreResult<Self> {
        config.validate().map_err(|e| error::CoreError::Validation(e.to_string()))?;
        let config = Arc::new(config);

        let storage = Arc::new(Storage::connect(&config.storage.db_path).await?);
        let events = Arc::new(EventBus::new(storage.clone()));
        let queue = Arc::new(JobQueue::new(config.watcher.queue_capacity));

        let reputation = Arc::new(ReputationClient::new(
            config.reputation.clone(),
            (*storage).clone(),
        ));

        let pipeline = Arc::new(
            DetectionPipeline::load(config.clone(), storage.clone(), reputation, events.clone()).await?,
        );

        let ingestor = Arc::new(Ingestor::new(storage.clone(), events.clone(), queue.clone()));

        Ok(AppContext {
            config,
            storage,
            events,
            queue,
            pipeline,
            ingestor,
        })
    }

    /// Starts the worker pool and, if any directories are configured, the
    /// filesystem watcher. Returns the worker pool handle so the caller can
    /// shut it down cooperatively, and the watcher guard (dropping it stops
    /// watching).
    pub fn spawn_background_tasks(&self) -> CoreResult<(WorkerPool, Option<FileWatcher>)> {
        let pool = WorkerPool::spawn(
            self.config.server.max_workers,
            self.queue.clone(),
            self.pipeline.clone(),
            self.events.clone(),
        );
        info!(workers = self.config.server.max_workers, "scan worker pool started");

        let watcher = if self.config.watcher.dirs.is_empty() {
            None
        } else {
            Some(
                FileWatcher::start(self.config.watcher.clone(), self.queue.clone(), self.events.clone())
                    .map_err(|e| error::CoreError::Internal(e.to_string()))?,
            )
        };

        Ok((pool, watcher))
    }
}
