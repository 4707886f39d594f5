//! Filesystem watcher (C8): subscribes to create/modify notifications over a
//! set of directories via the `notify` crate, debounces duplicate events per
//! path, and enqueues scan jobs.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::WatcherConfig;
use crate::event_bus::EventBus;
use crate::models::{Event, EventType, ScanJob};
use crate::queue::JobQueue;

/// Owns the `notify` watcher and the debounce map; lives for the process
/// lifetime once started. Dropping it stops watching.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Starts watching `config.dirs` and spawns the task that debounces and
    /// enqueues events. Returns immediately; watching continues in the
    /// background for as long as the returned `FileWatcher` is held.
    pub fn start(config: WatcherConfig, queue: Arc<JobQueue>, events: Arc<EventBus>) -> notify::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<NotifyEvent>();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => error!(error = %e, "filesystem watcher error"),
        })?;

        let mode = if config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };

        for dir in &config.dirs {
            match watcher.watch(std::path::Path::new(dir), mode) {
                Ok(()) => info!(dir, "watching directory"),
                Err(e) => warn!(dir, error = %e, "failed to watch directory"),
            }
        }

        let debounce = Duration::from_millis(config.debounce_ms);
        let dirs = config.dirs.clone();

        tokio::spawn(async move {
            let events_for_lifecycle = events.clone();
            events_for_lifecycle
                .publish(Event::new(EventType::WatchStarted, serde_json::json!({ "dirs": dirs })))
                .await;

            let last_seen: StdMutex<HashMap<PathBuf, Instant>> = StdMutex::new(HashMap::new());

            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                for path in event.paths {
                    if !path.is_file() {
                        continue;
                    }
                    let now = Instant::now();
                    let should_process = {
                        let mut seen = last_seen.lock().unwrap();
                        let fresh = seen
                            .get(&path)
                            .map(|last| now.duration_since(*last) >= debounce)
                            .unwrap_or(true);
                        if fresh {
                            seen.insert(path.clone(), now);
                        }
                        fresh
                    };
                    if !should_process {
                        continue;
                    }

                    let path_str = path.to_string_lossy().to_string();
                    queue.push(ScanJob::scan_file(path_str, Some("watcher".to_string()))).await;
                }
            }

            events
                .publish(Event::new(EventType::WatchStopped, serde_json::json!({ "dirs": dirs })))
                .await;
        });

        Ok(FileWatcher { _watcher: watcher })
    }
}
