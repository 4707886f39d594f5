//! Enforcement policy (§4.10): simulate / rename / quarantine, gated by a minimum
//! severity threshold and applied atomically after scoring.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{PolicyConfig, PolicyMode};
use crate::models::{PolicyAction, PolicyOutcome, Severity};

pub struct PolicyEngine;

impl PolicyEngine {
    /// Applies the configured policy to a scanned file. Always returns an outcome;
    /// never panics or propagates — an OS-level failure becomes `PolicyAction::Error`
    /// while the scan result itself is still emitted (§4.10, §7).
    pub fn apply(path: &Path, severity: Severity, config: &PolicyConfig, quarantine_dir: &str) -> PolicyOutcome {
        if severity < config.min_severity || config.mode == PolicyMode::Simulate {
            return PolicyOutcome {
                action: PolicyAction::Simulate,
                target_path: None,
                error: None,
            };
        }

        match config.mode {
            PolicyMode::Simulate => unreachable!("handled above"),
            PolicyMode::Rename => Self::rename(path),
            PolicyMode::Quarantine => Self::quarantine(path, quarantine_dir),
        }
    }

    fn rename(path: &Path) -> PolicyOutcome {
        let mut candidate = Self::blocked_name(path, None);
        let mut n = 1u32;
        while candidate.exists() {
            candidate = Self::blocked_name(path, Some(n));
            n += 1;
        }

        match std::fs::rename(path, &candidate) {
            Ok(()) => {
                info!(from = %path.display(), to = %candidate.display(), "renamed file per policy");
                PolicyOutcome {
                    action: PolicyAction::Rename,
                    target_path: Some(candidate.to_string_lossy().to_string()),
                    error: None,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to rename file per policy");
                PolicyOutcome {
                    action: PolicyAction::Error,
                    target_path: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    fn blocked_name(path: &Path, suffix: Option<u32>) -> PathBuf {
        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let blocked = match suffix {
            None => format!("{name}.blocked"),
            Some(n) => format!("{name}.blocked.{n}"),
        };
        path.with_file_name(blocked)
    }

    fn quarantine(path: &Path, quarantine_dir: &str) -> PolicyOutcome {
        if let Err(e) = std::fs::create_dir_all(quarantine_dir) {
            warn!(quarantine_dir, error = %e, "failed to create quarantine directory");
            return PolicyOutcome {
                action: PolicyAction::Error,
                target_path: None,
                error: Some(e.to_string()),
            };
        }

        let name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
        let mut candidate = Path::new(quarantine_dir).join(&name);
        let mut n = 1u32;
        while candidate.exists() {
            let (stem, ext) = split_stem_ext(&name);
            let suffixed = match &ext {
                Some(ext) => format!("{stem}_{n}.{ext}"),
                None => format!("{stem}_{n}"),
            };
            candidate = Path::new(quarantine_dir).join(suffixed);
            n += 1;
        }

        match std::fs::rename(path, &candidate) {
            Ok(()) => {
                info!(from = %path.display(), to = %candidate.display(), "quarantined file per policy");
                PolicyOutcome {
                    action: PolicyAction::Quarantine,
                    target_path: Some(candidate.to_string_lossy().to_string()),
                    error: None,
                }
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to quarantine file");
                PolicyOutcome {
                    action: PolicyAction::Error,
                    target_path: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn split_stem_ext(name: &str) -> (String, Option<String>) {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (name.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;

    fn config(mode: PolicyMode, min_severity: Severity) -> PolicyConfig {
        PolicyConfig { mode, min_severity }
    }

    #[test]
    fn below_threshold_always_simulates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, b"hi").unwrap();

        let cfg = config(PolicyMode::Quarantine, Severity::High);
        let outcome = PolicyEngine::apply(&path, Severity::Low, &cfg, dir.path().to_str().unwrap());
        assert_eq!(outcome.action, PolicyAction::Simulate);
        assert!(path.exists());
    }

    #[test]
    fn simulate_mode_never_touches_file_regardless_of_severity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.txt");
        std::fs::write(&path, b"hi").unwrap();

        let cfg = config(PolicyMode::Simulate, Severity::Low);
        let outcome = PolicyEngine::apply(&path, Severity::Critical, &cfg, dir.path().to_str().unwrap());
        assert_eq!(outcome.action, PolicyAction::Simulate);
        assert!(path.exists());
    }

    #[test]
    fn quarantine_moves_file_and_avoids_collision() {
        let src_dir = tempfile::tempdir().unwrap();
        let quarantine_dir = tempfile::tempdir().unwrap();
        let path = src_dir.path().join("evil.exe");
        std::fs::write(&path, b"hi").unwrap();

        std::fs::write(quarantine_dir.path().join("evil.exe"), b"already here").unwrap();

        let cfg = config(PolicyMode::Quarantine, Severity::Low);
        let outcome = PolicyEngine::apply(
            &path,
            Severity::High,
            &cfg,
            quarantine_dir.path().to_str().unwrap(),
        );
        assert_eq!(outcome.action, PolicyAction::Quarantine);
        assert!(!path.exists());
        let target = outcome.target_path.unwrap();
        assert!(target.ends_with("evil_1.exe"));
    }

    #[test]
    fn rename_uses_smallest_non_colliding_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("evil.exe");
        std::fs::write(&path, b"hi").unwrap();
        std::fs::write(dir.path().join("evil.exe.blocked"), b"taken").unwrap();

        let cfg = config(PolicyMode::Rename, Severity::Low);
        let outcome = PolicyEngine::apply(&path, Severity::High, &cfg, dir.path().to_str().unwrap());
        assert_eq!(outcome.action, PolicyAction::Rename);
        assert!(outcome.target_path.unwrap().ends_with("evil.exe.blocked.1"));
    }
}
