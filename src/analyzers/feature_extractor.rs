use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

use crate::error::CoreError;

const HEAD_READ_BYTES: usize = 128 * 1024;
const MAX_TEXT_CHARS: usize = 200_000;

const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "log", "csv", "json", "xml", "html", "md", "ini", "conf", "eml",
];

const OFFICE_EXTENSIONS: &[&str] = &["doc", "docx", "xls", "xlsx", "ppt", "pptx", "rtf"];
const ARCHIVE_EXTENSIONS: &[&str] = &["zip", "rar", "7z", "tar", "gz", "bz2", "xz"];
const SCRIPT_EXTENSIONS: &[&str] = &["js", "vbs", "ps1", "sh", "bat", "cmd", "py", "wsf"];
const PDF_EXTENSIONS: &[&str] = &["pdf"];

/// Extracted, purely-local features for one file. No network or database access.
#[derive(Debug, Clone, Default)]
pub struct FileFeatures {
    pub path: String,
    pub name: String,
    pub extension: Option<String>,
    pub size: u64,
    pub entropy: f64,
    pub mime: Option<String>,
    pub is_executable: bool,
    pub is_office: bool,
    pub is_archive: bool,
    pub is_script: bool,
    pub is_pdf: bool,
    pub sha256: String,
    pub text_snippet: Option<String>,
}

impl FileFeatures {
    /// Numeric view keyed by name, consumed by the anomaly scorer (§4.3) in the
    /// order declared by whichever artifact is loaded.
    pub fn as_feature_map(&self) -> std::collections::HashMap<String, f64> {
        let mut map = std::collections::HashMap::new();
        map.insert("size".to_string(), self.size as f64);
        map.insert("entropy".to_string(), self.entropy);
        map.insert("is_executable".to_string(), bool_to_f64(self.is_executable));
        map.insert("is_office".to_string(), bool_to_f64(self.is_office));
        map.insert("is_archive".to_string(), bool_to_f64(self.is_archive));
        map.insert("is_script".to_string(), bool_to_f64(self.is_script));
        map.insert("is_pdf".to_string(), bool_to_f64(self.is_pdf));
        map
    }
}

fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

pub struct FeatureExtractor;

impl FeatureExtractor {
    pub fn extract(path: &Path) -> Result<FileFeatures, CoreError> {
        let meta = std::fs::metadata(path)?;
        let size = meta.len();

        let mut file = std::fs::File::open(path)?;
        let mut head = vec![0u8; HEAD_READ_BYTES.min(size as usize)];
        let read = file.read(&mut head)?;
        head.truncate(read);

        let entropy = shannon_entropy(&head);
        let is_executable = has_executable_magic(&head);

        let mime = infer::get(&head)
            .map(|kind| kind.mime_type().to_string())
            .or_else(|| {
                mime_guess::from_path(path)
                    .first()
                    .map(|m| m.essence_str().to_string())
            });

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let extension = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()));

        let text_snippet = if extension
            .as_deref()
            .map(|e| TEXT_EXTENSIONS.contains(&e.trim_start_matches('.')))
            .unwrap_or(false)
        {
            std::fs::read_to_string(path)
                .ok()
                .map(|s| s.chars().take(MAX_TEXT_CHARS).collect())
        } else {
            None
        };

        let sha256 = sha256_of_file(path)?;

        let bare_ext = extension.as_deref().map(|e| e.trim_start_matches('.'));
        let is_office = bare_ext.map(|e| OFFICE_EXTENSIONS.contains(&e)).unwrap_or(false);
        let is_archive = bare_ext.map(|e| ARCHIVE_EXTENSIONS.contains(&e)).unwrap_or(false);
        let is_script = bare_ext.map(|e| SCRIPT_EXTENSIONS.contains(&e)).unwrap_or(false);
        let is_pdf = bare_ext.map(|e| PDF_EXTENSIONS.contains(&e)).unwrap_or(false);

        Ok(FileFeatures {
            path: path.to_string_lossy().to_string(),
            name,
            extension,
            size,
            entropy,
            mime,
            is_executable,
            is_office,
            is_archive,
            is_script,
            is_pdf,
            sha256,
            text_snippet,
        })
    }
}

fn has_executable_magic(head: &[u8]) -> bool {
    head.starts_with(b"MZ")
        || head.starts_with(b"\x7fELF")
        || head.starts_with(b"\xcf\xfa\xed\xfe")
        || head.starts_with(b"\xfe\xed\xfa\xcf")
}

/// Shannon entropy of a byte slice, base-2, in bits/byte, range [0,8].
pub fn shannon_entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut counts = [0u64; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let len = data.len() as f64;
    counts
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / len;
            -p * p.log2()
        })
        .sum()
}

pub fn sha256_of_file(path: &Path) -> Result<String, CoreError> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_entropy_for_uniform_bytes() {
        let data = vec![0u8; 1024];
        assert_eq!(shannon_entropy(&data), 0.0);
    }

    #[test]
    fn detects_pe_magic() {
        let mut head = b"MZ".to_vec();
        head.extend_from_slice(&[0u8; 64]);
        assert!(has_executable_magic(&head));
    }

    #[test]
    fn detects_elf_magic() {
        let head = b"\x7fELF\x02\x01\x01\x00".to_vec();
        assert!(has_executable_magic(&head));
    }

    #[test]
    fn extract_computes_sha256_and_entropy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, b"hello world").unwrap();

        let features = FeatureExtractor::extract(&path).unwrap();
        assert_eq!(features.size, 11);
        assert!(features.entropy > 0.0);
        assert_eq!(
            features.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
