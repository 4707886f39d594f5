use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    FastEvent,
    ScanResult,
    ScanError,
    SignatureHit,
    WatchStarted,
    WatchStopped,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FastEvent => "fast_event",
            EventType::ScanResult => "scan_result",
            EventType::ScanError => "scan_error",
            EventType::SignatureHit => "signature_hit",
            EventType::WatchStarted => "watch_started",
            EventType::WatchStopped => "watch_stopped",
        }
    }
}

/// A single published event. `payload` carries the event-specific body; `severity`,
/// `action` and `device_id` are pulled out of it (when present) purely so the
/// persistence layer can index on them without re-parsing JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts: f64,
    pub event_type: String,
    pub path: Option<String>,
    pub severity: Option<String>,
    pub action: Option<String>,
    pub source: Option<String>,
    pub device_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(event_type: EventType, payload: serde_json::Value) -> Self {
        let severity = payload
            .get("severity")
            .and_then(|v| v.as_str())
            .or_else(|| payload.pointer("/result/severity").and_then(|v| v.as_str()))
            .map(str::to_string);
        let action = payload
            .get("action")
            .and_then(|v| v.as_str())
            .or_else(|| payload.pointer("/policy/action").and_then(|v| v.as_str()))
            .map(str::to_string);
        let device_id = payload
            .pointer("/agent/id")
            .and_then(|v| v.as_str())
            .or_else(|| payload.get("device_id").and_then(|v| v.as_str()))
            .map(str::to_string);
        let path = payload.get("path").and_then(|v| v.as_str()).map(str::to_string);
        let source = payload.get("source").and_then(|v| v.as_str()).map(str::to_string);

        Event {
            ts: now_secs(),
            event_type: event_type.as_str().to_string(),
            path,
            severity,
            action,
            source,
            device_id,
            payload,
        }
    }
}

fn now_secs() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
