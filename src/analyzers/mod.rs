pub mod anomaly_scorer;
pub mod feature_extractor;
pub mod nlp_analyzer;
pub mod reputation_client;
pub mod signature_matcher;

pub use anomaly_scorer::{AnomalyScorer, IsolationForestArtifact};
pub use feature_extractor::{FeatureExtractor, FileFeatures};
pub use nlp_analyzer::NlpAnalyzer;
pub use reputation_client::{reputation_component, ReputationClient};
pub use signature_matcher::{RuleSet, SignatureMatcher, SignatureRules};
