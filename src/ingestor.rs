//! Fast-event ingestor (C12): accepts signed pushes from endpoint agents,
//! does a cheap offline hash lookup, and fans the result out as a `fast_event`
//! without running the full detection pipeline inline.

use md5::{Digest, Md5};
use serde::Deserialize;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::event_bus::EventBus;
use crate::models::{DeviceDescriptor, Event, EventType, ScanJob};
use crate::queue::JobQueue;
use crate::storage::Storage;

/// Wire shape of `POST /events/push` (§6): `ts`/`policy` are accepted and
/// folded into the published event's payload as-is; `meta.sha256`, when
/// present, is preferred over a freshly computed MD5 for the offline lookup.
#[derive(Debug, Deserialize)]
pub struct FastEventRequest {
    #[serde(default)]
    pub ts: Option<f64>,
    pub path: String,
    #[serde(default)]
    pub meta: Option<serde_json::Value>,
    #[serde(default)]
    pub policy: Option<serde_json::Value>,
    #[serde(default)]
    pub agent: DeviceDescriptor,
    #[serde(default)]
    pub enqueue_deep_scan: bool,
}

impl FastEventRequest {
    fn sha256(&self) -> Option<&str> {
        self.meta.as_ref()?.get("sha256")?.as_str()
    }
}

pub struct Ingestor {
    storage: Arc<Storage>,
    events: Arc<EventBus>,
    queue: Arc<JobQueue>,
}

impl Ingestor {
    pub fn new(storage: Arc<Storage>, events: Arc<EventBus>, queue: Arc<JobQueue>) -> Self {
        Ingestor { storage, events, queue }
    }

    /// Compares `presented` against `expected` in constant time, independent
    /// of where the first differing byte falls, so authentication failures
    /// can't be timed to guess the token.
    pub fn authenticate(expected: &str, presented: &str) -> bool {
        let expected = expected.as_bytes();
        let presented = presented.as_bytes();
        if expected.len() != presented.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in expected.iter().zip(presented.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    pub async fn ingest(&self, req: FastEventRequest) -> IngestOutcome {
        let path = Path::new(&req.path);
        let file_exists = path.is_file();

        let mut signature_hit_payload: Option<serde_json::Value> = None;

        if file_exists {
            let sha256 = req.sha256().map(str::to_string);
            let md5 = compute_md5(path).ok();
            let offline_hit = self.storage.signature_lookup(sha256.as_deref(), md5.as_deref()).await;

            if let Some(hit) = offline_hit {
                signature_hit_payload = Some(serde_json::json!({
                    "path": req.path,
                    "family": hit.family,
                    "category": hit.category,
                    "severity": hit.severity,
                    "source": hit.source,
                }));
            }
        }

        if let Some(payload) = &signature_hit_payload {
            self.events.publish(Event::new(EventType::SignatureHit, payload.clone())).await;
        }

        if let Err(e) = self.storage.upsert_device(&req.agent).await {
            tracing::warn!(error = %e, "failed to upsert device from fast event");
        }

        self.events
            .publish(Event::new(
                EventType::FastEvent,
                serde_json::json!({
                    "path": req.path,
                    "ts": req.ts,
                    "device_id": req.agent.device_id(),
                    "meta": req.meta,
                    "policy": req.policy,
                    "file_exists": file_exists,
                    "signature_hit": signature_hit_payload,
                }),
            ))
            .await;

        let enqueued_deep_scan = req.enqueue_deep_scan && file_exists;
        if enqueued_deep_scan {
            self.queue
                .push(ScanJob::scan_file(req.path.clone(), req.agent.device_id()))
                .await;
        }

        IngestOutcome {
            published: true,
            enqueued_deep_scan,
        }
    }
}

pub struct IngestOutcome {
    pub published: bool,
    pub enqueued_deep_scan: bool,
}

fn compute_md5(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_accepts_matching_tokens() {
        assert!(Ingestor::authenticate("secret-token", "secret-token"));
    }

    #[test]
    fn authenticate_rejects_mismatched_tokens() {
        assert!(!Ingestor::authenticate("secret-token", "wrong-token"));
    }

    #[test]
    fn authenticate_rejects_different_lengths() {
        assert!(!Ingestor::authenticate("short", "a-much-longer-token"));
    }
}
