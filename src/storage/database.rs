//! Embedded SQL persistence: scan results, the offline signature DB, the
//! reputation cache, the event log, and the device registry all live in a
//! single SQLite database file (WAL-enabled, foreign keys enforced).
//!
//! Writes are serialized through an internal mutex rather than a fan-in
//! channel/actor: `SqlitePool` already gives us safe concurrent readers under
//! WAL, so the mutex only needs to guarantee that two writers never race each
//! other, which is the property `analysis-engine`'s `Database` leans on
//! `PgPool`'s own connection serialization for. Every table create statement
//! below runs with `PRAGMA foreign_keys = ON` already set on the pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{CoreResult, DatabaseError};
use crate::models::{
    DeviceDescriptor, Event, OfflineSignatureHit, ScanResult, Severity, ThreatCategory,
};

/// A row in the offline, hash-addressed signature database (§3, §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub sha256: Option<String>,
    pub md5: Option<String>,
    pub family: Option<String>,
    pub sig_type: String,
    pub severity: Severity,
    pub source: String,
    pub meta: serde_json::Value,
}

/// Cheaply `Clone`: the pool is already reference-counted internally and the
/// write-serializing mutex is shared via `Arc` so every clone still funnels
/// through the same single writer.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    write_lock: Arc<Mutex<()>>,
}

impl Storage {
    pub async fn connect(db_path: &str) -> CoreResult<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.ok();
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(|e| DatabaseError::Connection(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys=ON").execute(&pool).await?;

        let storage = Storage {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        storage.run_migrations().await?;
        info!(db_path, "storage initialized");
        Ok(storage)
    }

    async fn run_migrations(&self) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS devices (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                os TEXT,
                arch TEXT,
                version TEXT,
                last_seen REAL NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scan_results (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                extension TEXT,
                mime_type TEXT,
                size_bytes INTEGER NOT NULL,
                sha256 TEXT NOT NULL,
                signature_json TEXT NOT NULL,
                anomaly_json TEXT NOT NULL,
                nlp_json TEXT NOT NULL,
                reputation_json TEXT NOT NULL,
                threat_score REAL NOT NULL,
                severity TEXT NOT NULL,
                category TEXT NOT NULL,
                policy_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_results_sha256 ON scan_results(sha256)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reputation_cache (
                cache_key TEXT PRIMARY KEY,
                report TEXT NOT NULL,
                fetched_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS signatures (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sha256 TEXT UNIQUE,
                md5 TEXT UNIQUE,
                family TEXT,
                sig_type TEXT NOT NULL,
                severity TEXT NOT NULL,
                source TEXT NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL,
                meta TEXT NOT NULL DEFAULT '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL NOT NULL,
                type TEXT NOT NULL,
                path TEXT,
                severity TEXT,
                action TEXT,
                source TEXT,
                device_id TEXT,
                data TEXT NOT NULL,
                FOREIGN KEY(device_id) REFERENCES devices(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- scan results -------------------------------------------------

    pub async fn record_scan_result(&self, result: &ScanResult) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;

        let signature_json = serde_json::to_string(&result.signature)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let anomaly_json = serde_json::to_string(&result.anomaly)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let nlp_json = serde_json::to_string(&result.nlp)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let reputation_json = serde_json::to_string(&result.reputation)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        let policy_json = serde_json::to_string(&result.policy)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO scan_results (
                id, path, name, extension, mime_type, size_bytes, sha256,
                signature_json, anomaly_json, nlp_json, reputation_json,
                threat_score, severity, category, policy_json, created_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(result.id.to_string())
        .bind(&result.path)
        .bind(&result.name)
        .bind(&result.extension)
        .bind(&result.mime_type)
        .bind(result.size_bytes as i64)
        .bind(&result.sha256)
        .bind(signature_json)
        .bind(anomaly_json)
        .bind(nlp_json)
        .bind(reputation_json)
        .bind(result.threat_score)
        .bind(result.severity.to_string())
        .bind(format!("{:?}", result.category).to_lowercase())
        .bind(policy_json)
        .bind(result.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- reputation cache ----------------------------------------------

    /// A cache miss (or a read error) is logged and treated as absent; the
    /// reputation client falls back to a network lookup either way.
    pub async fn reputation_cache_get(&self, cache_key: &str) -> Option<String> {
        match sqlx::query("SELECT report FROM reputation_cache WHERE cache_key = ?")
            .bind(cache_key)
            .fetch_optional(&self.pool)
            .await
        {
            Ok(Some(row)) => row.try_get::<String, _>("report").ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "reputation cache read failed");
                None
            }
        }
    }

    pub async fn reputation_cache_set(&self, cache_key: &str, report: &str) {
        let _guard = self.write_lock.lock().await;
        let fetched_at = Utc::now().to_rfc3339();
        let result = sqlx::query(
            r#"
            INSERT INTO reputation_cache (cache_key, report, fetched_at) VALUES (?, ?, ?)
            ON CONFLICT(cache_key) DO UPDATE SET report = excluded.report, fetched_at = excluded.fetched_at
            "#,
        )
        .bind(cache_key)
        .bind(report)
        .bind(fetched_at)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!(error = %e, "reputation cache write failed");
        }
    }

    // ---- offline signature DB -------------------------------------------

    /// Tries SHA-256 first; only falls back to MD5 on a miss when both are
    /// supplied (resolves the open question in SPEC_FULL.md §9).
    pub async fn signature_lookup(
        &self,
        sha256: Option<&str>,
        md5: Option<&str>,
    ) -> Option<OfflineSignatureHit> {
        if let Some(sha256) = sha256 {
            if let Some(hit) = self.signature_lookup_by("sha256", sha256).await {
                return Some(hit);
            }
        }
        if let Some(md5) = md5 {
            if let Some(hit) = self.signature_lookup_by("md5", md5).await {
                return Some(hit);
            }
        }
        None
    }

    async fn signature_lookup_by(&self, column: &str, value: &str) -> Option<OfflineSignatureHit> {
        let sql = format!(
            "SELECT family, sig_type, severity, source FROM signatures WHERE {column} = ? COLLATE NOCASE"
        );
        let row = sqlx::query(&sql).bind(value).fetch_optional(&self.pool).await;
        match row {
            Ok(Some(row)) => {
                let family: Option<String> = row.try_get("family").ok().flatten();
                let sig_type: String = row.try_get("sig_type").unwrap_or_default();
                let severity: String = row.try_get("severity").unwrap_or_default();
                let source: String = row.try_get("source").unwrap_or_default();
                Some(OfflineSignatureHit {
                    family,
                    category: category_from_type(&sig_type),
                    severity: severity.parse().unwrap_or(Severity::Low),
                    source,
                })
            }
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "signature lookup failed");
                None
            }
        }
    }

    /// Upsert semantics: keep the earliest `first_seen`, bump `last_seen` to
    /// the max, upgrade severity only when strictly higher, overwrite
    /// `source`/`meta`. Idempotent modulo `last_seen`.
    pub async fn upsert_signature(&self, rec: &SignatureRecord) -> CoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();

        let existing = if let Some(sha256) = &rec.sha256 {
            sqlx::query("SELECT first_seen, last_seen, severity FROM signatures WHERE sha256 = ?")
                .bind(sha256)
                .fetch_optional(&self.pool)
                .await?
        } else if let Some(md5) = &rec.md5 {
            sqlx::query("SELECT first_seen, last_seen, severity FROM signatures WHERE md5 = ?")
                .bind(md5)
                .fetch_optional(&self.pool)
                .await?
        } else {
            return Err(DatabaseError::Query("signature record has neither sha256 nor md5".into()).into());
        };

        let meta = serde_json::to_string(&rec.meta).unwrap_or_else(|_| "{}".to_string());

        match existing {
            Some(row) => {
                let first_seen: String = row.try_get("first_seen")?;
                let last_seen: String = row.try_get("last_seen")?;
                let prev_severity: String = row.try_get("severity")?;
                let prev_severity: Severity = prev_severity.parse().unwrap_or(Severity::Low);
                let last_seen_dt: DateTime<Utc> =
                    DateTime::parse_from_rfc3339(&last_seen).map(|d| d.with_timezone(&Utc)).unwrap_or(now);
                let new_last_seen = now.max(last_seen_dt).to_rfc3339();
                let new_severity = prev_severity.max(rec.severity);

                let key_col = if rec.sha256.is_some() { "sha256" } else { "md5" };
                let key_val = rec.sha256.clone().or_else(|| rec.md5.clone()).unwrap();
                let sql = format!(
                    "UPDATE signatures SET family=?, sig_type=?, severity=?, source=?, last_seen=?, meta=? WHERE {key_col} = ?"
                );
                sqlx::query(&sql)
                    .bind(&rec.family)
                    .bind(&rec.sig_type)
                    .bind(new_severity.to_string())
                    .bind(&rec.source)
                    .bind(new_last_seen)
                    .bind(meta)
                    .bind(key_val)
                    .execute(&self.pool)
                    .await?;
                let _ = first_seen;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO signatures (sha256, md5, family, sig_type, severity, source, first_seen, last_seen, meta)
                    VALUES (?,?,?,?,?,?,?,?,?)
                    "#,
                )
                .bind(&rec.sha256)
                .bind(&rec.md5)
                .bind(&rec.family)
                .bind(&rec.sig_type)
                .bind(rec.severity.to_string())
                .bind(&rec.source)
                .bind(now.to_rfc3339())
                .bind(now.to_rfc3339())
                .bind(meta)
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    // ---- events & devices ------------------------------------------------

    /// Best-effort: a DB failure here must never drop the in-memory SSE
    /// publish (§4.11), so errors are logged and swallowed.
    pub async fn record_event(&self, event: &Event) {
        let _guard = self.write_lock.lock().await;
        let data = serde_json::to_string(&event.payload).unwrap_or_else(|_| "{}".to_string());
        let result = sqlx::query(
            r#"
            INSERT INTO events (ts, type, path, severity, action, source, device_id, data)
            VALUES (?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(event.ts)
        .bind(&event.event_type)
        .bind(&event.path)
        .bind(&event.severity)
        .bind(&event.action)
        .bind(&event.source)
        .bind(&event.device_id)
        .bind(data)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            error!(error = %e, event_type = %event.event_type, "failed to persist event");
        }
    }

    pub async fn upsert_device(&self, descriptor: &DeviceDescriptor) -> CoreResult<()> {
        let Some(id) = descriptor.device_id() else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let name = descriptor
            .hostname
            .clone()
            .or_else(|| descriptor.name.clone())
            .unwrap_or_else(|| id.clone());
        let meta = serde_json::to_string(&descriptor.extra).unwrap_or_else(|_| "{}".to_string());
        let now = Utc::now().timestamp() as f64;

        sqlx::query(
            r#"
            INSERT INTO devices (id, name, os, arch, version, last_seen, meta)
            VALUES (?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                os = excluded.os,
                arch = excluded.arch,
                version = excluded.version,
                last_seen = excluded.last_seen,
                meta = excluded.meta
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(&descriptor.os)
        .bind(&descriptor.arch)
        .bind(&descriptor.version)
        .bind(now)
        .bind(meta)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

fn category_from_type(sig_type: &str) -> ThreatCategory {
    match sig_type.to_lowercase().as_str() {
        "ransomware" => ThreatCategory::Ransomware,
        "malware" => ThreatCategory::Malware,
        "phishing" => ThreatCategory::Phishing,
        "trojan" => ThreatCategory::Trojan,
        "worm" => ThreatCategory::Worm,
        "spyware" => ThreatCategory::Spyware,
        _ => ThreatCategory::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventType;

    async fn temp_storage() -> (Storage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let storage = Storage::connect(path.to_str().unwrap()).await.unwrap();
        (storage, dir)
    }

    #[tokio::test]
    async fn reputation_cache_round_trips() {
        let (storage, _dir) = temp_storage().await;
        assert!(storage.reputation_cache_get("abc").await.is_none());
        storage.reputation_cache_set("abc", "{\"malicious\":1}").await;
        assert_eq!(
            storage.reputation_cache_get("abc").await.unwrap(),
            "{\"malicious\":1}"
        );
    }

    #[tokio::test]
    async fn signature_upsert_is_idempotent_modulo_last_seen() {
        let (storage, _dir) = temp_storage().await;
        let rec = SignatureRecord {
            sha256: Some("deadbeef".to_string()),
            md5: None,
            family: Some("emotet".to_string()),
            sig_type: "malware".to_string(),
            severity: Severity::High,
            source: "feed-a".to_string(),
            meta: serde_json::json!({}),
        };
        storage.upsert_signature(&rec).await.unwrap();
        storage.upsert_signature(&rec).await.unwrap();

        let hit = storage.signature_lookup(Some("deadbeef"), None).await.unwrap();
        assert_eq!(hit.family.as_deref(), Some("emotet"));
        assert_eq!(hit.severity, Severity::High);
    }

    #[tokio::test]
    async fn signature_upsert_upgrades_severity_never_downgrades() {
        let (storage, _dir) = temp_storage().await;
        let mut rec = SignatureRecord {
            sha256: Some("cafef00d".to_string()),
            md5: None,
            family: None,
            sig_type: "malware".to_string(),
            severity: Severity::Medium,
            source: "feed-a".to_string(),
            meta: serde_json::json!({}),
        };
        storage.upsert_signature(&rec).await.unwrap();
        rec.severity = Severity::Low;
        storage.upsert_signature(&rec).await.unwrap();

        let hit = storage.signature_lookup(Some("cafef00d"), None).await.unwrap();
        assert_eq!(hit.severity, Severity::Medium);
    }

    #[tokio::test]
    async fn event_persistence_is_best_effort() {
        let (storage, _dir) = temp_storage().await;
        let event = Event::new(EventType::ScanError, serde_json::json!({"path": "/tmp/x"}));
        storage.record_event(&event).await;
    }
}
