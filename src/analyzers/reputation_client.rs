use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ReputationConfig;
use crate::error::ReputationError;
use crate::models::ReputationReport;
use crate::storage::Storage;

const LARGE_FILE_THRESHOLD: u64 = 32 * 1024 * 1024;

/// Sliding-window rate limiter: at most N requests in any trailing 60s window.
struct RateLimiter {
    max_per_minute: u32,
    timestamps: Mutex<Vec<std::time::Instant>>,
}

impl RateLimiter {
    fn new(max_per_minute: u32) -> Self {
        RateLimiter {
            max_per_minute,
            timestamps: Mutex::new(Vec::new()),
        }
    }

    async fn wait_if_needed(&self) {
        loop {
            let mut stamps = self.timestamps.lock().await;
            let now = std::time::Instant::now();
            stamps.retain(|t| now.duration_since(*t) < Duration::from_secs(60));

            if (stamps.len() as u32) < self.max_per_minute {
                stamps.push(now);
                return;
            }

            let oldest = stamps[0];
            let sleep_for = Duration::from_secs(60)
                .saturating_sub(now.duration_since(oldest))
                + Duration::from_millis(100);
            drop(stamps);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct LastAnalysisStats {
    #[serde(default)]
    malicious: u32,
    #[serde(default)]
    suspicious: u32,
    #[serde(default)]
    undetected: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReputationSummary {
    pub malicious: u32,
    pub suspicious: u32,
    pub undetected: u32,
    pub detection_ratio: String,
    pub engines_flagging: Vec<String>,
    pub permalink: Option<String>,
}

pub struct ReputationClient {
    config: ReputationConfig,
    http: reqwest::Client,
    rate_limiter: RateLimiter,
    storage: Storage,
}

impl ReputationClient {
    pub fn new(config: ReputationConfig, storage: Storage) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build reputation http client");
        let rate_limiter = RateLimiter::new(config.max_requests_per_minute);
        ReputationClient {
            config,
            http,
            rate_limiter,
            storage,
        }
    }

    pub async fn lookup(&self, sha256: &str) -> Result<ReputationReport, ReputationError> {
        let cache_key = format!("file_report:{sha256}");
        if let Some(cached) = self.storage.reputation_cache_get(&cache_key).await {
            if let Ok(summary) = serde_json::from_str::<ReputationSummary>(&cached) {
                debug!(sha256, "reputation cache hit");
                return Ok(to_report(summary, true));
            }
        }

        let path = format!("/files/{sha256}");
        let value = self.request("GET", &path, None).await?;
        let summary = summarize(&value);

        if let Ok(serialized) = serde_json::to_string(&summary) {
            self.storage.reputation_cache_set(&cache_key, &serialized).await;
        }

        Ok(to_report(summary, false))
    }

    /// Uploads a file (direct multipart for files <= 32MiB, presigned PUT otherwise)
    /// and polls the resulting analysis until terminal.
    pub async fn scan_and_wait(&self, path: &Path) -> Result<ReputationReport, ReputationError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| ReputationError::Provider {
                status: 0,
                body: e.to_string(),
            })?;

        let analysis_id = if metadata.len() <= LARGE_FILE_THRESHOLD {
            self.upload_small(path).await?
        } else {
            self.upload_large(path).await?
        };

        self.poll_analysis(&analysis_id).await
    }

    async fn upload_small(&self, path: &Path) -> Result<String, ReputationError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| ReputationError::Provider {
            status: 0,
            body: e.to_string(),
        })?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());

        self.rate_limiter.wait_if_needed().await;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .authed_request(reqwest::Method::POST, "/files")
            .multipart(form)
            .send()
            .await?;
        let value: serde_json::Value = resp.json().await?;
        extract_analysis_id(&value)
    }

    async fn upload_large(&self, path: &Path) -> Result<String, ReputationError> {
        let upload_url_resp = self.request("GET", "/files/upload_url", None).await?;
        let upload_url = upload_url_resp
            .pointer("/data")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ReputationError::Provider {
                status: 0,
                body: "missing upload_url in response".to_string(),
            })?
            .to_string();

        let bytes = tokio::fs::read(path).await.map_err(|e| ReputationError::Provider {
            status: 0,
            body: e.to_string(),
        })?;

        self.rate_limiter.wait_if_needed().await;
        let resp = self.http.put(&upload_url).body(bytes).send().await?;
        let value: serde_json::Value = resp.json().await?;
        extract_analysis_id(&value)
    }

    async fn poll_analysis(&self, analysis_id: &str) -> Result<ReputationReport, ReputationError> {
        let path = format!("/analyses/{analysis_id}");
        let started = std::time::Instant::now();
        let timeout = Duration::from_secs(self.config.analysis_timeout_secs);

        loop {
            let value = self.request("GET", &path, None).await?;
            let status = value
                .pointer("/data/attributes/status")
                .and_then(|v| v.as_str())
                .unwrap_or("");

            if status == "completed" || status == "completed_with_errors" {
                let summary = summarize(&value);
                return Ok(to_report(summary, false));
            }

            if started.elapsed() >= timeout {
                return Err(ReputationError::PollTimeout {
                    elapsed_secs: started.elapsed().as_secs(),
                });
            }

            tokio::time::sleep(Duration::from_secs(self.config.poll_interval_secs)).await;
        }
    }

    /// Core request loop: rate-limits, retries with exponential backoff on
    /// network errors / 5xx / 429 (honoring `Retry-After`), up to `max_retries`.
    async fn request(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ReputationError> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 0..self.config.max_retries {
            self.rate_limiter.wait_if_needed().await;

            let method_enum = method.parse::<reqwest::Method>().unwrap_or(reqwest::Method::GET);
            let mut req = self.authed_request(method_enum, path);
            if let Some(ref b) = body {
                req = req.json(b);
            }

            let result = req.send().await;
            match result {
                Err(e) => {
                    warn!(attempt, error = %e, "reputation request network error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    continue;
                }
                Ok(resp) => {
                    let status = resp.status();
                    if status == reqwest::StatusCode::NO_CONTENT {
                        return Ok(serde_json::json!({}));
                    }
                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = resp
                            .headers()
                            .get("Retry-After")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .map(Duration::from_secs)
                            .unwrap_or(backoff);
                        tokio::time::sleep(retry_after).await;
                        backoff *= 2;
                        continue;
                    }
                    if status.is_server_error() {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                        continue;
                    }
                    if status.is_success() {
                        return resp.json::<serde_json::Value>().await.map_err(Into::into);
                    }
                    let body_text = resp.text().await.unwrap_or_default();
                    return Err(ReputationError::Provider {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
            }
        }

        Err(ReputationError::ExhaustedRetries {
            attempts: self.config.max_retries,
        })
    }

    fn authed_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.config.base_url, path);
        let mut builder = self.http.request(method, url);
        if let Some(key) = &self.config.api_key {
            builder = builder.header("x-apikey", key);
        }
        builder
    }
}

fn extract_analysis_id(value: &serde_json::Value) -> Result<String, ReputationError> {
    value
        .pointer("/data/id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| ReputationError::Provider {
            status: 0,
            body: "missing analysis id in response".to_string(),
        })
}

fn summarize(value: &serde_json::Value) -> ReputationSummary {
    let stats: LastAnalysisStats = value
        .pointer("/data/attributes/last_analysis_stats")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or(LastAnalysisStats {
            malicious: 0,
            suspicious: 0,
            undetected: 0,
        });

    let mut engines_flagging = Vec::new();
    if let Some(results) = value
        .pointer("/data/attributes/last_analysis_results")
        .and_then(|v| v.as_object())
    {
        for (engine, verdict) in results {
            let category = verdict.get("category").and_then(|c| c.as_str()).unwrap_or("");
            if category == "malicious" || category == "suspicious" {
                engines_flagging.push(engine.clone());
            }
        }
    }

    let total = stats.malicious + stats.suspicious + stats.undetected;
    let detection_ratio = format!("{}/{}", stats.malicious, total.max(1));
    let permalink = value
        .pointer("/data/links/self")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    ReputationSummary {
        malicious: stats.malicious,
        suspicious: stats.suspicious,
        undetected: stats.undetected,
        detection_ratio,
        engines_flagging,
        permalink,
    }
}

fn to_report(summary: ReputationSummary, from_cache: bool) -> ReputationReport {
    let verdict = if summary.malicious > 0 {
        Some("malicious".to_string())
    } else if summary.suspicious > 0 {
        Some("suspicious".to_string())
    } else {
        None
    };

    ReputationReport {
        detected_by: summary.malicious,
        vendors: summary.engines_flagging,
        tags: Vec::new(),
        verdict,
        permalink: summary.permalink,
        from_cache,
    }
}

/// `rep_comp = min(1, malicious / 8)`.
pub fn reputation_component(malicious: u32) -> f64 {
    (malicious as f64 / 8.0).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reputation_component_caps_at_one() {
        assert_eq!(reputation_component(0), 0.0);
        assert_eq!(reputation_component(4), 0.5);
        assert_eq!(reputation_component(8), 1.0);
        assert_eq!(reputation_component(20), 1.0);
    }

    #[test]
    fn summarize_extracts_flagging_engines() {
        let value = serde_json::json!({
            "data": {
                "attributes": {
                    "last_analysis_stats": {"malicious": 3, "suspicious": 1, "undetected": 60},
                    "last_analysis_results": {
                        "EngineA": {"category": "malicious"},
                        "EngineB": {"category": "undetected"},
                        "EngineC": {"category": "suspicious"}
                    }
                }
            }
        });
        let summary = summarize(&value);
        assert_eq!(summary.malicious, 3);
        assert_eq!(summary.engines_flagging.len(), 2);
    }
}
