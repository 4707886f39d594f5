//! Detection orchestration (C1 -> C6): runs feature extraction, signature
//! matching, anomaly scoring, NLP analysis and reputation lookup over one
//! file, then fuses the results into a single scan result.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::analyzers::{
    AnomalyScorer, FeatureExtractor, NlpAnalyzer, ReputationClient, SignatureMatcher,
    SignatureRules,
};
use crate::config::Config;
use crate::error::CoreResult;
use crate::event_bus::EventBus;
use crate::models::{
    Event, EventType, PolicyOutcome, ScanResult, Severity, ThreatCategory, ThreatCategoryVote,
};
use crate::policy::PolicyEngine;
use crate::snapshot::Snapshot;
use crate::storage::Storage;

/// Everything that can hot-reload together: the signature rule sets and the
/// anomaly model. Held behind a `Snapshot` so a reload swaps both atomically
/// and in-flight scans keep the `Arc` they took at dispatch time.
pub struct DetectionSnapshot {
    pub rules: SignatureRules,
    pub anomaly: AnomalyScorer,
}

pub struct DetectionPipeline {
    snapshot: Snapshot<DetectionSnapshot>,
    storage: Arc<Storage>,
    reputation: Arc<ReputationClient>,
    events: Arc<EventBus>,
    config: Arc<Config>,
}

impl DetectionPipeline {
    pub async fn load(
        config: Arc<Config>,
        storage: Arc<Storage>,
        reputation: Arc<ReputationClient>,
        events: Arc<EventBus>,
    ) -> CoreResult<Self> {
        let rules = SignatureRules::load(&config.signatures.signatures_dir).await?;
        let anomaly = AnomalyScorer::load(&config.storage.anomaly_model_path).await;
        Ok(DetectionPipeline {
            snapshot: Snapshot::new(DetectionSnapshot { rules, anomaly }),
            storage,
            reputation,
            events,
            config,
        })
    }

    /// Reloads signature rules and the anomaly model from disk and swaps them
    /// in together. Scans already in flight keep their own snapshot.
    pub async fn reload(&self) -> CoreResult<()> {
        let rules = SignatureRules::load(&self.config.signatures.signatures_dir).await?;
        let anomaly = AnomalyScorer::load(&self.config.storage.anomaly_model_path).await;
        self.snapshot.store(DetectionSnapshot { rules, anomaly });
        info!("detection snapshot reloaded");
        Ok(())
    }

    /// Runs the full detection + enforcement pipeline for one file on disk,
    /// persists the result, and publishes it on the event bus. `source`
    /// identifies the producer (watcher, agent id, directory walk, upload).
    pub async fn scan(&self, path: &Path, source: Option<String>) -> CoreResult<ScanResult> {
        let snapshot = self.snapshot.load();

        let features = FeatureExtractor::extract(path)?;

        let mut signature = SignatureMatcher::match_all(
            &snapshot.rules,
            &features.sha256,
            features.extension.as_deref(),
            features.text_snippet.as_deref(),
        );

        let md5 = None; // offline DB is addressed primarily by sha256; md5 supplied by fast-event path
        let offline_hit = self.storage.signature_lookup(Some(&features.sha256), md5).await;
        if let Some(hit) = &offline_hit {
            let vote = match hit.category {
                ThreatCategory::Ransomware => Some(ThreatCategoryVote::Ransomware),
                ThreatCategory::Malware | ThreatCategory::Trojan | ThreatCategory::Worm | ThreatCategory::Spyware => {
                    Some(ThreatCategoryVote::Malware)
                }
                ThreatCategory::Phishing => Some(ThreatCategoryVote::Phishing),
                ThreatCategory::Unknown => None,
            };
            if let Some(vote) = vote {
                signature.votes.push(vote);
            }
            signature.hits.push(format!("offline_db:{}", hit.source));
            signature.offline_db_hit = Some(hit.clone());

            self.events
                .publish(Event::new(
                    EventType::SignatureHit,
                    serde_json::json!({
                        "path": path.to_string_lossy(),
                        "sha256": features.sha256,
                        "family": hit.family,
                        "source": hit.source,
                    }),
                ))
                .await;
        }

        let anomaly = snapshot.anomaly.score(&features.as_feature_map());

        let nlp = NlpAnalyzer::analyze(features.text_snippet.as_deref());

        let reputation = match self.reputation.lookup(&features.sha256).await {
            Ok(report) => report,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reputation lookup failed, scoring without it");
                Default::default()
            }
        };

        let fused = fuse(FuseInputs {
            ai_is_anomaly: anomaly.is_anomaly,
            ai_raw: anomaly.raw_score,
            sig_score: signature.score,
            sig_votes: &signature.votes,
            rep_malicious_count: reputation.detected_by,
            rep_tags: &reputation.tags,
            nlp_score: nlp.score,
        });

        let mut severity = fused.severity;
        if let Some(hit) = &offline_hit {
            severity = severity.max(hit.severity);
        }

        let policy = PolicyEngine::apply(
            path,
            severity,
            &self.config.policy,
            &self.config.storage.quarantine_dir,
        );

        let mut result = ScanResult::new(
            path.to_string_lossy().to_string(),
            features.name.clone(),
            features.sha256.clone(),
        );
        result.extension = features.extension;
        result.mime_type = features.mime;
        result.size_bytes = features.size;
        result.signature = signature;
        result.anomaly = anomaly;
        result.nlp = nlp;
        result.reputation = reputation;
        result.threat_score = fused.threat_score;
        result.severity = severity;
        result.category = fused.category;
        result.policy = policy;

        if let Err(e) = self.storage.record_scan_result(&result).await {
            warn!(path = %path.display(), error = %e, "failed to persist scan result");
        }

        self.events
            .publish(Event::new(
                EventType::ScanResult,
                serde_json::json!({
                    "path": result.path,
                    "source": source,
                    "result": result,
                    "policy": { "action": policy_action_str(&result.policy) },
                }),
            ))
            .await;

        Ok(result)
    }
}

fn policy_action_str(outcome: &PolicyOutcome) -> String {
    serde_json::to_value(&outcome.action)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

struct FuseInputs<'a> {
    ai_is_anomaly: bool,
    ai_raw: f64,
    sig_score: f64,
    sig_votes: &'a [ThreatCategoryVote],
    rep_malicious_count: u32,
    rep_tags: &'a [String],
    nlp_score: f64,
}

struct FuseOutput {
    threat_score: f64,
    severity: Severity,
    category: ThreatCategory,
}

const PHISHING_NLP_THRESHOLD: f64 = 0.65;

/// Pure scoring function (§4.6): no I/O, no side effects, safe to unit test
/// directly against the documented formulas.
fn fuse(inputs: FuseInputs) -> FuseOutput {
    let ai_comp = if inputs.ai_is_anomaly {
        1.0 / (1.0 + (3.0 * inputs.ai_raw).exp())
    } else {
        0.0
    };
    let rep_comp = (inputs.rep_malicious_count as f64 / 8.0).min(1.0);
    let nlp_comp = inputs.nlp_score.clamp(0.0, 1.0);

    let threat_score = (0.45 * rep_comp + 0.25 * inputs.sig_score + 0.20 * ai_comp + 0.10 * nlp_comp)
        .clamp(0.0, 1.0);

    let severity = Severity::from_score(threat_score);

    let has_phishing_signature_hit = inputs.sig_votes.contains(&ThreatCategoryVote::Phishing);
    let category = if inputs.nlp_score >= PHISHING_NLP_THRESHOLD && has_phishing_signature_hit {
        ThreatCategory::Phishing
    } else {
        category_by_vote(&inputs, nlp_comp)
    };

    FuseOutput {
        threat_score,
        severity,
        category,
    }
}

/// First-occurrence ordering across the three vote sources: signature votes,
/// then reputation tags intersected with the known category set, then an
/// NLP-derived phishing vote when its score clears the threshold.
fn category_by_vote(inputs: &FuseInputs, _nlp_comp: f64) -> ThreatCategory {
    let mut ordered: Vec<ThreatCategory> = Vec::new();

    for vote in inputs.sig_votes {
        ordered.push(match vote {
            ThreatCategoryVote::Ransomware => ThreatCategory::Ransomware,
            ThreatCategoryVote::Malware => ThreatCategory::Malware,
            ThreatCategoryVote::Phishing => ThreatCategory::Phishing,
        });
    }

    for tag in inputs.rep_tags {
        if let Some(cat) = known_category(tag) {
            ordered.push(cat);
        }
    }

    if inputs.nlp_score >= PHISHING_NLP_THRESHOLD {
        ordered.push(ThreatCategory::Phishing);
    }

    if ordered.is_empty() {
        return ThreatCategory::Unknown;
    }

    let mut counts: Vec<(ThreatCategory, usize)> = Vec::new();
    for cat in &ordered {
        if let Some(entry) = counts.iter_mut().find(|(c, _)| c == cat) {
            entry.1 += 1;
        } else {
            counts.push((*cat, 1));
        }
    }

    // `counts` preserves first-occurrence order; scan forward so ties resolve
    // to whichever category was voted first, not `Vec::max_by_key`'s last-wins.
    let mut best: Option<(ThreatCategory, usize)> = None;
    for (cat, count) in counts {
        match best {
            Some((_, best_count)) if count <= best_count => {}
            _ => best = Some((cat, count)),
        }
    }
    best.map(|(cat, _)| cat).unwrap_or(ThreatCategory::Unknown)
}

fn known_category(tag: &str) -> Option<ThreatCategory> {
    match tag.to_lowercase().as_str() {
        "ransomware" => Some(ThreatCategory::Ransomware),
        "malware" => Some(ThreatCategory::Malware),
        "phishing" => Some(ThreatCategory::Phishing),
        "trojan" => Some(ThreatCategory::Trojan),
        "worm" => Some(ThreatCategory::Worm),
        "spyware" => Some(ThreatCategory::Spyware),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_hits_produces_zero_score_and_unknown_category() {
        let out = fuse(FuseInputs {
            ai_is_anomaly: false,
            ai_raw: 0.0,
            sig_score: 0.0,
            sig_votes: &[],
            rep_malicious_count: 0,
            rep_tags: &[],
            nlp_score: 0.0,
        });
        assert_eq!(out.threat_score, 0.0);
        assert_eq!(out.severity, Severity::Low);
        assert_eq!(out.category, ThreatCategory::Unknown);
    }

    #[test]
    fn high_reputation_count_alone_crosses_medium() {
        let out = fuse(FuseInputs {
            ai_is_anomaly: false,
            ai_raw: 0.0,
            sig_score: 0.0,
            sig_votes: &[],
            rep_malicious_count: 10,
            rep_tags: &[],
            nlp_score: 0.0,
        });
        assert!(out.threat_score >= 0.45);
        assert!(out.severity >= Severity::Medium);
    }

    #[test]
    fn anomaly_component_uses_logistic_curve_only_when_flagged() {
        let flagged = fuse(FuseInputs {
            ai_is_anomaly: true,
            ai_raw: -0.3,
            sig_score: 0.0,
            sig_votes: &[],
            rep_malicious_count: 0,
            rep_tags: &[],
            nlp_score: 0.0,
        });
        let not_flagged = fuse(FuseInputs {
            ai_is_anomaly: false,
            ai_raw: -0.3,
            sig_score: 0.0,
            sig_votes: &[],
            rep_malicious_count: 0,
            rep_tags: &[],
            nlp_score: 0.0,
        });
        assert!(flagged.threat_score > not_flagged.threat_score);
        assert_eq!(not_flagged.threat_score, 0.0);
    }

    #[test]
    fn high_nlp_with_phishing_signature_forces_phishing_category() {
        let out = fuse(FuseInputs {
            ai_is_anomaly: false,
            ai_raw: 0.0,
            sig_score: 0.2,
            sig_votes: &[ThreatCategoryVote::Malware, ThreatCategoryVote::Phishing],
            rep_malicious_count: 0,
            rep_tags: &[],
            nlp_score: 0.9,
        });
        assert_eq!(out.category, ThreatCategory::Phishing);
    }

    #[test]
    fn tie_in_votes_breaks_by_first_occurrence() {
        let out = category_by_vote(
            &FuseInputs {
                ai_is_anomaly: false,
                ai_raw: 0.0,
                sig_score: 0.0,
                sig_votes: &[ThreatCategoryVote::Malware, ThreatCategoryVote::Ransomware],
                rep_malicious_count: 0,
                rep_tags: &[],
                nlp_score: 0.0,
            },
            0.0,
        );
        assert_eq!(out, ThreatCategory::Malware);
    }

    #[test]
    fn severity_thresholds_match_spec() {
        assert_eq!(Severity::from_score(0.0), Severity::Low);
        assert_eq!(Severity::from_score(0.34), Severity::Low);
        assert_eq!(Severity::from_score(0.35), Severity::Medium);
        assert_eq!(Severity::from_score(0.55), Severity::High);
        assert_eq!(Severity::from_score(0.80), Severity::Critical);
    }
}
