use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::AnomalyReport;

/// One axis-aligned split node in a serialized isolation tree.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum IsolationNode {
    #[serde(rename = "split")]
    Split {
        feature: usize,
        threshold: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
    #[serde(rename = "leaf")]
    Leaf { depth: f64 },
}

impl IsolationNode {
    fn path_length(&self, sample: &[f64]) -> f64 {
        match self {
            IsolationNode::Leaf { depth } => *depth,
            IsolationNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                let value = sample.get(*feature).copied().unwrap_or(0.0);
                if value < *threshold {
                    1.0 + left.path_length(sample)
                } else {
                    1.0 + right.path_length(sample)
                }
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IsolationForestArtifact {
    pub features: Vec<String>,
    pub trees: Vec<IsolationNode>,
    #[serde(default)]
    pub scaler_mean: Vec<f64>,
    #[serde(default)]
    pub scaler_scale: Vec<f64>,
    /// Average path length threshold below which a sample is flagged anomalous.
    pub anomaly_threshold: f64,
    pub sample_size: f64,
}

impl IsolationForestArtifact {
    /// `c(n)` normalization constant for isolation forest path lengths (Liu et al.).
    fn normalization_constant(&self) -> f64 {
        let n = self.sample_size.max(2.0);
        2.0 * ((n - 1.0).ln() + 0.5772156649) - (2.0 * (n - 1.0) / n)
    }

    fn normalize(&self, sample: &[f64]) -> Vec<f64> {
        if self.scaler_mean.len() != sample.len() || self.scaler_scale.len() != sample.len() {
            return sample.to_vec();
        }
        sample
            .iter()
            .zip(self.scaler_mean.iter())
            .zip(self.scaler_scale.iter())
            .map(|((v, mean), scale)| {
                if *scale == 0.0 {
                    0.0
                } else {
                    (v - mean) / scale
                }
            })
            .collect()
    }

    /// Returns `(is_anomaly, decision_value)`. Larger decision values mean more typical
    /// (matches scikit-learn's IsolationForest sign convention).
    pub fn score(&self, sample_by_feature: &std::collections::HashMap<String, f64>) -> (bool, f64) {
        let sample: Vec<f64> = self
            .features
            .iter()
            .map(|f| *sample_by_feature.get(f).unwrap_or(&0.0))
            .collect();
        let normalized = self.normalize(&sample);

        let avg_path_length: f64 = if self.trees.is_empty() {
            0.0
        } else {
            self.trees.iter().map(|t| t.path_length(&normalized)).sum::<f64>()
                / self.trees.len() as f64
        };

        let c = self.normalization_constant();
        let anomaly_score = if c > 0.0 {
            2f64.powf(-avg_path_length / c)
        } else {
            0.0
        };
        // decision function: positive => inlier, negative => outlier (0.5 is the boundary)
        let decision_value = 0.5 - anomaly_score;
        let is_anomaly = avg_path_length < self.anomaly_threshold;
        (is_anomaly, decision_value)
    }
}

pub struct AnomalyScorer {
    artifact: Option<IsolationForestArtifact>,
}

impl AnomalyScorer {
    /// Loads the artifact from disk; a missing or unparseable file disables the
    /// detector without failing startup.
    pub async fn load(path: &str) -> Self {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<IsolationForestArtifact>(&content) {
                Ok(artifact) => {
                    info!(path, trees = artifact.trees.len(), "loaded anomaly model");
                    AnomalyScorer {
                        artifact: Some(artifact),
                    }
                }
                Err(e) => {
                    warn!(path, error = %e, "anomaly model present but unparseable, disabling detector");
                    AnomalyScorer { artifact: None }
                }
            },
            Err(_) => {
                warn!(path, "anomaly model not found, disabling detector");
                AnomalyScorer { artifact: None }
            }
        }
    }

    pub fn score(&self, features: &std::collections::HashMap<String, f64>) -> AnomalyReport {
        match &self.artifact {
            None => AnomalyReport {
                is_anomaly: false,
                raw_score: 0.0,
                model_loaded: false,
            },
            Some(artifact) => {
                let (is_anomaly, raw) = artifact.score(features);
                AnomalyReport {
                    is_anomaly,
                    raw_score: raw,
                    model_loaded: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn toy_artifact() -> IsolationForestArtifact {
        IsolationForestArtifact {
            features: vec!["entropy".to_string(), "size".to_string()],
            trees: vec![IsolationNode::Split {
                feature: 0,
                threshold: 0.0,
                left: Box::new(IsolationNode::Leaf { depth: 1.0 }),
                right: Box::new(IsolationNode::Leaf { depth: 4.0 }),
            }],
            scaler_mean: vec![0.0, 0.0],
            scaler_scale: vec![1.0, 1.0],
            anomaly_threshold: 2.0,
            sample_size: 256.0,
        }
    }

    #[test]
    fn short_path_is_flagged_anomalous() {
        let artifact = toy_artifact();
        let mut sample = HashMap::new();
        sample.insert("entropy".to_string(), -1.0);
        sample.insert("size".to_string(), 0.0);
        let (is_anomaly, _) = artifact.score(&sample);
        assert!(is_anomaly);
    }

    #[test]
    fn long_path_is_not_flagged() {
        let artifact = toy_artifact();
        let mut sample = HashMap::new();
        sample.insert("entropy".to_string(), 1.0);
        sample.insert("size".to_string(), 0.0);
        let (is_anomaly, _) = artifact.score(&sample);
        assert!(!is_anomaly);
    }

    #[tokio::test]
    async fn missing_file_disables_detector() {
        let scorer = AnomalyScorer::load("/nonexistent/path/model.json").await;
        let report = scorer.score(&HashMap::new());
        assert!(!report.model_loaded);
        assert!(!report.is_anomaly);
        assert_eq!(report.raw_score, 0.0);
    }
}
