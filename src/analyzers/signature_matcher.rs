use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::models::{SignatureReport, ThreatCategoryVote};

const HASH_WEIGHT: f64 = 0.60;
const DOMAIN_WEIGHT: f64 = 0.30;
const KEYWORD_OR_EXTENSION_WEIGHT: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFamily {
    Malware,
    Ransomware,
    Phishing,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuleSet {
    #[serde(default)]
    pub hashes: HashSet<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub suspicious_extensions: HashSet<String>,
    #[serde(default)]
    pub domains: HashSet<String>,
}

/// An immutable snapshot of the three loaded rule files. Reload produces a
/// fresh `SignatureRules` that replaces the one behind the shared snapshot.
#[derive(Debug, Clone, Default)]
pub struct SignatureRules {
    pub malware: RuleSet,
    pub ransomware: RuleSet,
    pub phishing: RuleSet,
    pub version: String,
}

impl SignatureRules {
    pub async fn load(dir: &str) -> Result<Self, CoreError> {
        let dir_path = Path::new(dir);
        let malware = Self::load_file(dir_path, "malware_signatures.json").await;
        let ransomware = Self::load_file(dir_path, "ransomware_signatures.json").await;
        let phishing = Self::load_file(dir_path, "phishing_signatures.json").await;

        let version = Self::version_of(dir_path).await;

        info!(
            malware_hashes = malware.hashes.len(),
            ransomware_hashes = ransomware.hashes.len(),
            phishing_domains = phishing.domains.len(),
            "loaded signature rule sets"
        );

        Ok(SignatureRules {
            malware,
            ransomware,
            phishing,
            version,
        })
    }

    async fn load_file(dir: &Path, name: &str) -> RuleSet {
        let path = dir.join(name);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(file = %path.display(), error = %e, "failed to parse signature file");
                RuleSet::default()
            }),
            Err(_) => {
                warn!(file = %path.display(), "signature file missing, using empty rule set");
                RuleSet::default()
            }
        }
    }

    async fn version_of(dir: &Path) -> String {
        let mut names = vec![
            "malware_signatures.json",
            "ransomware_signatures.json",
            "phishing_signatures.json",
        ];
        names.sort();
        let mut hasher = Sha256::new();
        for name in names {
            if let Ok(content) = tokio::fs::read(dir.join(name)).await {
                hasher.update(&content);
            }
        }
        hex::encode(hasher.finalize())[..12].to_string()
    }
}

pub struct SignatureMatcher;

impl SignatureMatcher {
    /// Matches against the in-memory rule sets only; the offline hash database
    /// lookup is a separate persistence-layer call, merged by the caller.
    pub fn match_all(
        rules: &SignatureRules,
        sha256: &str,
        extension: Option<&str>,
        text_snippet: Option<&str>,
    ) -> SignatureReport {
        let mut hits = Vec::new();
        let mut score: f64 = 0.0;
        let mut votes = Vec::new();

        let lower_text = text_snippet.map(|t| t.to_lowercase());
        let ext = extension.map(|e| e.to_lowercase());

        if rules.malware.hashes.contains(sha256) {
            hits.push("malware:hash".to_string());
            score += HASH_WEIGHT;
            votes.push(ThreatCategoryVote::Malware);
        }
        if rules.ransomware.hashes.contains(sha256) {
            hits.push("ransomware:hash".to_string());
            score += HASH_WEIGHT;
            votes.push(ThreatCategoryVote::Ransomware);
        }

        if let Some(ext) = &ext {
            if rules.malware.suspicious_extensions.contains(ext) {
                hits.push(format!("malware:extension:{ext}"));
                score += KEYWORD_OR_EXTENSION_WEIGHT;
                votes.push(ThreatCategoryVote::Malware);
            }
            if rules.ransomware.suspicious_extensions.contains(ext) {
                hits.push(format!("ransomware:extension:{ext}"));
                score += KEYWORD_OR_EXTENSION_WEIGHT;
                votes.push(ThreatCategoryVote::Ransomware);
            }
            if rules.phishing.suspicious_extensions.contains(ext) {
                hits.push(format!("phishing:extension:{ext}"));
                score += KEYWORD_OR_EXTENSION_WEIGHT;
                votes.push(ThreatCategoryVote::Phishing);
            }
        }

        if let Some(text) = &lower_text {
            for kw in &rules.malware.keywords {
                if text.contains(&kw.to_lowercase()) {
                    hits.push(format!("malware:keyword:{kw}"));
                    score += KEYWORD_OR_EXTENSION_WEIGHT;
                    votes.push(ThreatCategoryVote::Malware);
                }
            }
            for kw in &rules.ransomware.keywords {
                if text.contains(&kw.to_lowercase()) {
                    hits.push(format!("ransomware:keyword:{kw}"));
                    score += KEYWORD_OR_EXTENSION_WEIGHT;
                    votes.push(ThreatCategoryVote::Ransomware);
                }
            }
            for kw in &rules.phishing.keywords {
                if text.contains(&kw.to_lowercase()) {
                    hits.push(format!("phishing:keyword:{kw}"));
                    score += KEYWORD_OR_EXTENSION_WEIGHT;
                    votes.push(ThreatCategoryVote::Phishing);
                }
            }
            for domain in &rules.phishing.domains {
                if text.contains(&domain.to_lowercase()) {
                    hits.push(format!("phishing:domain:{domain}"));
                    score += DOMAIN_WEIGHT;
                    votes.push(ThreatCategoryVote::Phishing);
                }
            }
        }

        SignatureReport {
            hits,
            score: score.min(1.0),
            votes,
            offline_db_hit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules_with_hash(hash: &str) -> SignatureRules {
        let mut malware = RuleSet::default();
        malware.hashes.insert(hash.to_string());
        SignatureRules {
            malware,
            ransomware: RuleSet::default(),
            phishing: RuleSet::default(),
            version: "test".to_string(),
        }
    }

    #[test]
    fn hash_hit_scores_point_six_and_votes_malware() {
        let rules = rules_with_hash("deadbeef");
        let report = SignatureMatcher::match_all(&rules, "deadbeef", None, None);
        assert_eq!(report.score, 0.60);
        assert_eq!(report.votes, vec![ThreatCategoryVote::Malware]);
    }

    #[test]
    fn no_hits_produces_zero_score() {
        let rules = SignatureRules::default();
        let report = SignatureMatcher::match_all(&rules, "abc123", Some(".txt"), Some("hello"));
        assert_eq!(report.score, 0.0);
        assert!(report.hits.is_empty());
    }

    #[test]
    fn score_is_capped_at_one() {
        let mut rules = rules_with_hash("h1");
        rules.ransomware.hashes.insert("h1".to_string());
        rules.phishing.domains.insert("evil.example".to_string());
        let report = SignatureMatcher::match_all(&rules, "h1", None, Some("visit evil.example now"));
        assert!(report.score <= 1.0);
    }
}
