//! Model file descriptors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// A model file found on disk by a directory scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// File name, e.g. `qwen2.5-1.5b-instruct-q4_k_m.gguf`
    pub name: String,

    /// Absolute path to the file
    pub path: PathBuf,

    pub size_bytes: u64,

    pub last_modified: DateTime<Utc>,

    /// Whether the file looks like a usable model (large enough to hold weights)
    pub is_valid: bool,
}

/// The model currently bound to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
}

impl ModelInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            loaded_at: Utc::now(),
        }
    }

    /// The file name without its directory.
    pub fn file_name(&self) -> String {
        file_name_of(&self.path)
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_strips_directories() {
        let info = ModelInfo::new("/models/qwen2-0_5b-instruct-q4_k_m.gguf");
        assert_eq!(info.file_name(), "qwen2-0_5b-instruct-q4_k_m.gguf");
    }
}
