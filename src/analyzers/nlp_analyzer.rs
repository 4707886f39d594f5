use lazy_static::lazy_static;
use regex::Regex;

use crate::models::NlpReport;

lazy_static! {
    static ref URL_RE: Regex = Regex::new(r"https?://[^\s]+").unwrap();
    static ref OTP_RE: Regex = Regex::new(r"(?i)\b(otp|one.time.(code|password)|verification code)\b").unwrap();
    static ref BANKING_RE: Regex =
        Regex::new(r"(?i)\b(account|bank|iban|swift|routing number|wire transfer)\b").unwrap();
    static ref URGENCY_RE: Regex =
        Regex::new(r"(?i)\b(urgent|immediately|suspend(ed)?|act now|expires? (today|soon)|final notice)\b").unwrap();
    static ref LOGIN_RE: Regex =
        Regex::new(r"(?i)\b(verify your account|reset your password|confirm your (identity|details)|click (here|this link)|sign in)\b").unwrap();
    static ref CRYPTO_RE: Regex = Regex::new(r"(?i)\b(bitcoin|btc|crypto|wallet address|ethereum)\b").unwrap();
    static ref CARD_RE: Regex = Regex::new(r"\b(?:\d[ -]?){13,19}\b").unwrap();
}

/// Term-weighted logistic scorer standing in for a fitted TF-IDF + logistic
/// regression pipeline; weights are a small embedded lexicon rather than a
/// trained artifact, since training itself is out of scope here.
const MODEL_TERMS: &[(&str, f64)] = &[
    ("verify", 0.9),
    ("password", 0.7),
    ("suspend", 0.8),
    ("urgent", 0.6),
    ("click", 0.5),
    ("account", 0.4),
    ("confirm", 0.5),
    ("login", 0.5),
    ("bank", 0.5),
    ("wallet", 0.6),
    ("gift card", 0.7),
    ("invoice", 0.3),
];

fn model_sentence_score(sentence: &str) -> f64 {
    let lower = sentence.to_lowercase();
    let mut logit = -2.0; // bias toward "benign" by default
    for (term, weight) in MODEL_TERMS {
        if lower.contains(term) {
            logit += weight;
        }
    }
    1.0 / (1.0 + (-logit).exp())
}

fn rule_boost(sentence: &str) -> f64 {
    let mut boost = 0.0;
    if URL_RE.is_match(sentence) {
        boost += 0.15;
    }
    if OTP_RE.is_match(sentence) {
        boost += 0.25;
    }
    if BANKING_RE.is_match(sentence) {
        boost += 0.20;
    }
    if URGENCY_RE.is_match(sentence) {
        boost += 0.20;
    }
    if LOGIN_RE.is_match(sentence) {
        boost += 0.30;
    }
    if CRYPTO_RE.is_match(sentence) {
        boost += 0.20;
    }
    if CARD_RE.is_match(sentence) {
        boost += 0.20;
    }
    boost.min(0.3 * 7.0)
}

fn split_sentences(text: &str) -> Vec<&str> {
    text.split(|c| c == '.' || c == '\n' || c == '!' || c == '?')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Default)]
struct HeaderAnalysis {
    risk: f64,
}

/// Parses a minimal RFC-5322-ish header block from the top of `text` (as produced
/// by `.eml` files) and flags sender/auth inconsistencies.
fn analyze_headers(text: &str) -> HeaderAnalysis {
    let header_block: String = text
        .lines()
        .take_while(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if header_block.is_empty() {
        return HeaderAnalysis::default();
    }

    let mut risk: f64 = 0.0;
    let lower = header_block.to_lowercase();

    let from_domain = extract_header_domain(&lower, "from:");
    let reply_to_domain = extract_header_domain(&lower, "reply-to:");
    if let (Some(from), Some(reply_to)) = (&from_domain, &reply_to_domain) {
        if from != reply_to {
            risk += 0.35;
        }
    }

    if lower.contains("spf=fail") || lower.contains("dkim=fail") || lower.contains("dmarc=fail") {
        risk += 0.40;
    }

    if let Some(subject_line) = header_block.lines().find(|l| l.to_lowercase().starts_with("subject:")) {
        if URGENCY_RE.is_match(subject_line) {
            risk += 0.20;
        }
    }

    let received_count = header_block
        .to_lowercase()
        .lines()
        .filter(|l| l.starts_with("received:"))
        .count();
    if received_count > 6 {
        risk += 0.15;
    }

    HeaderAnalysis { risk: risk.min(1.0) }
}

fn extract_header_domain(lower_block: &str, header: &str) -> Option<String> {
    lower_block
        .lines()
        .find(|l| l.starts_with(header))
        .and_then(|l| l.split('@').nth(1))
        .map(|rest| {
            rest.trim_matches(|c: char| !c.is_alphanumeric() && c != '.' && c != '-')
                .to_string()
        })
}

pub struct NlpAnalyzer;

impl NlpAnalyzer {
    pub fn analyze(text: Option<&str>) -> NlpReport {
        let Some(text) = text else {
            return NlpReport::default();
        };
        if text.trim().is_empty() {
            return NlpReport::default();
        }

        let language_hint = whatlang::detect(text).map(|info| info.lang().code().to_string());

        let mut scored: Vec<(String, f64)> = split_sentences(text)
            .into_iter()
            .map(|s| {
                let fused = 0.6 * model_sentence_score(s) + 0.4 * rule_boost(s);
                (s.to_string(), fused.min(1.0))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let top: Vec<&(String, f64)> = scored.iter().take(10).collect();
        let doc_score = if top.is_empty() {
            0.0
        } else {
            top.iter().map(|(_, s)| s).sum::<f64>() / top.len() as f64
        };

        let header = analyze_headers(text);
        let fused = (0.85 * doc_score + 0.15 * header.risk).clamp(0.0, 1.0);

        let suspicious_sentences = top
            .iter()
            .filter(|(_, s)| *s >= 0.5)
            .map(|(s, _)| s.clone())
            .collect();

        NlpReport {
            language_hint,
            score: fused,
            suspicious_sentences,
            header_risk: header.risk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_yields_zero_score() {
        let report = NlpAnalyzer::analyze(Some(""));
        assert_eq!(report.score, 0.0);
    }

    #[test]
    fn no_text_yields_default_report() {
        let report = NlpAnalyzer::analyze(None);
        assert_eq!(report.score, 0.0);
        assert!(report.language_hint.is_none());
    }

    #[test]
    fn phishing_phrasing_scores_high() {
        let text = "URGENT: verify your account by clicking this link immediately or it will be suspended.";
        let report = NlpAnalyzer::analyze(Some(text));
        assert!(report.score >= 0.5, "expected high score, got {}", report.score);
    }

    #[test]
    fn benign_text_scores_low() {
        let text = "Here are the minutes from today's engineering standup meeting.";
        let report = NlpAnalyzer::analyze(Some(text));
        assert!(report.score < 0.35);
    }

    #[test]
    fn spf_fail_header_raises_risk() {
        let text = "From: ceo@example.com\nReply-To: attacker@evil.example\nSubject: urgent action needed\nAuthentication-Results: spf=fail\n\nPlease verify your account.";
        let report = NlpAnalyzer::analyze(Some(text));
        assert!(report.header_risk > 0.5);
    }
}
