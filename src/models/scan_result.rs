use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Total-ordered danger label. `max()` is used wherever a match should only
/// ever raise, never lower, the result's severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.80 {
            Severity::Critical
        } else if score >= 0.55 {
            Severity::High
        } else if score >= 0.35 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }

    pub fn max(self, other: Self) -> Self {
        std::cmp::max(self, other)
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Severity {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatCategory {
    Ransomware,
    Malware,
    Phishing,
    Trojan,
    Worm,
    Spyware,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Simulate,
    None,
    Rename,
    Quarantine,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignatureReport {
    pub hits: Vec<String>,
    pub score: f64,
    pub votes: Vec<ThreatCategoryVote>,
    pub offline_db_hit: Option<OfflineSignatureHit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreatCategoryVote {
    Ransomware,
    Malware,
    Phishing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineSignatureHit {
    pub family: Option<String>,
    pub category: ThreatCategory,
    pub severity: Severity,
    pub source: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub is_anomaly: bool,
    pub raw_score: f64,
    pub model_loaded: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NlpReport {
    pub language_hint: Option<String>,
    pub score: f64,
    pub suspicious_sentences: Vec<String>,
    pub header_risk: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReputationReport {
    pub detected_by: u32,
    pub vendors: Vec<String>,
    pub tags: Vec<String>,
    pub verdict: Option<String>,
    pub permalink: Option<String>,
    pub from_cache: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyOutcome {
    pub action: PolicyAction,
    pub target_path: Option<String>,
    pub error: Option<String>,
}

impl Default for PolicyOutcome {
    fn default() -> Self {
        PolicyOutcome {
            action: PolicyAction::Simulate,
            target_path: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub id: Uuid,
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
    pub sha256: String,

    pub signature: SignatureReport,
    pub anomaly: AnomalyReport,
    pub nlp: NlpReport,
    pub reputation: ReputationReport,

    pub threat_score: f64,
    pub severity: Severity,
    pub category: ThreatCategory,

    pub policy: PolicyOutcome,
    pub created_at: DateTime<Utc>,
}

impl ScanResult {
    pub fn new(path: impl Into<String>, name: impl Into<String>, sha256: impl Into<String>) -> Self {
        ScanResult {
            id: Uuid::new_v4(),
            path: path.into(),
            name: name.into(),
            extension: None,
            mime_type: None,
            size_bytes: 0,
            sha256: sha256.into(),
            signature: SignatureReport::default(),
            anomaly: AnomalyReport::default(),
            nlp: NlpReport::default(),
            reputation: ReputationReport::default(),
            threat_score: 0.0,
            severity: Severity::Low,
            category: ThreatCategory::Unknown,
            policy: PolicyOutcome::default(),
            created_at: Utc::now(),
        }
    }
}
