//! Model discovery: find `.gguf` files in a directory.
//!
//! Files smaller than [`MIN_MODEL_SIZE_BYTES`] are listed but marked invalid;
//! a truncated download or a stray placeholder should not be picked as the
//! default model.

use chrono::{DateTime, Utc};
use quill_core::model::ModelEntry;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

/// File extension of loadable model files (matched case-insensitively).
pub const GGUF_EXTENSION: &str = "gguf";

/// Smallest file size treated as a usable model.
pub const MIN_MODEL_SIZE_BYTES: u64 = 50 * 1024 * 1024;

/// Scans one directory (non-recursively) for model files.
#[derive(Debug, Clone)]
pub struct ModelScanner {
    dir: PathBuf,
    min_size_bytes: u64,
}

impl ModelScanner {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            min_size_bytes: MIN_MODEL_SIZE_BYTES,
        }
    }

    /// Override the validity threshold.
    pub fn with_min_size(mut self, bytes: u64) -> Self {
        self.min_size_bytes = bytes;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All `.gguf` files in the directory, newest first.
    ///
    /// A missing or unreadable directory yields an empty list.
    pub fn scan(&self) -> Vec<ModelEntry> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "Model directory not readable");
                return Vec::new();
            }
        };

        let mut models: Vec<ModelEntry> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| self.describe(&entry.path()))
            .collect();

        models.sort_by(|a, b| {
            b.last_modified
                .cmp(&a.last_modified)
                .then_with(|| a.name.cmp(&b.name))
        });

        debug!(dir = %self.dir.display(), count = models.len(), "Scanned model directory");
        models
    }

    /// The newest valid model, if any.
    pub fn first_valid(&self) -> Option<ModelEntry> {
        self.scan().into_iter().find(|m| m.is_valid)
    }

    fn describe(&self, path: &Path) -> Option<ModelEntry> {
        let is_gguf = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(GGUF_EXTENSION));
        if !is_gguf {
            return None;
        }

        let metadata = match std::fs::metadata(path) {
            Ok(m) if m.is_file() => m,
            Ok(_) => return None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping unreadable model file");
                return None;
            }
        };

        let last_modified: DateTime<Utc> = metadata
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH)
            .into();
        let size_bytes = metadata.len();

        Some(ModelEntry {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf()),
            size_bytes,
            last_modified,
            is_valid: size_bytes >= self.min_size_bytes,
        })
    }
}

/// Human-readable size with one decimal: `"1.5 GB"`, `"512.0 KB"`, `"12 B"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::Duration;

    fn write_model(dir: &Path, name: &str, size: u64, age_secs: u64) {
        let file = File::create(dir.join(name)).unwrap();
        file.set_len(size).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    #[test]
    fn missing_directory_is_empty() {
        let scanner = ModelScanner::new("/definitely/not/a/real/quill/dir");
        assert!(scanner.scan().is_empty());
        assert!(scanner.first_valid().is_none());
    }

    #[test]
    fn only_gguf_files_are_listed() {
        let tmp = tempfile::tempdir().unwrap();
        write_model(tmp.path(), "model.gguf", 10, 0);
        write_model(tmp.path(), "UPPER.GGUF", 10, 0);
        write_model(tmp.path(), "notes.txt", 10, 0);
        std::fs::create_dir(tmp.path().join("dir.gguf")).unwrap();

        let mut names: Vec<String> = ModelScanner::new(tmp.path())
            .scan()
            .into_iter()
            .map(|m| m.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["UPPER.GGUF", "model.gguf"]);
    }

    #[test]
    fn newest_first_and_validity_threshold() {
        let tmp = tempfile::tempdir().unwrap();
        write_model(tmp.path(), "old.gguf", 2048, 3600);
        write_model(tmp.path(), "new.gguf", 2048, 10);
        write_model(tmp.path(), "stub.gguf", 100, 0);

        let scanner = ModelScanner::new(tmp.path()).with_min_size(1024);
        let models = scanner.scan();
        let names: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["stub.gguf", "new.gguf", "old.gguf"]);
        assert!(!models[0].is_valid);
        assert!(models[1].is_valid);
        assert!(models[0].path.is_absolute());

        let first = scanner.first_valid().unwrap();
        assert_eq!(first.name, "new.gguf");
        assert_eq!(first.size_bytes, 2048);
    }

    #[test]
    fn default_threshold_is_fifty_mebibytes() {
        let tmp = tempfile::tempdir().unwrap();
        write_model(tmp.path(), "big.gguf", MIN_MODEL_SIZE_BYTES, 0);
        write_model(tmp.path(), "small.gguf", MIN_MODEL_SIZE_BYTES - 1, 0);

        let models = ModelScanner::new(tmp.path()).scan();
        let big = models.iter().find(|m| m.name == "big.gguf").unwrap();
        let small = models.iter().find(|m| m.name == "small.gguf").unwrap();
        assert!(big.is_valid);
        assert!(!small.is_valid);
    }

    #[test]
    fn format_size_units() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(1023), "1023 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(50 * 1024 * 1024), "50.0 MB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024 / 2), "1.5 GB");
    }
}
