use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Recursively lists `.gguf` model files under `folder`, sorted by path.
pub fn discover_model_files(folder: &Path) -> Vec<ModelFile> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_model = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));

        if !is_model {
            continue;
        }

        let name = entry
            .path()
            .strip_prefix(folder)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        let size_bytes = fs::metadata(entry.path())
            .map(|meta| meta.len())
            .unwrap_or_default();

        files.push(ModelFile {
            name,
            path: entry.path().to_path_buf(),
            size_bytes,
        });
    }

    files.sort_unstable_by(|left, right| left.path.cmp(&right.path));
    files
}
