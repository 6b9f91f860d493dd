use crate::utils::format_bytes;
use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A finished run's output directory
#[derive(Debug, Clone, Serialize)]
pub struct OutputEntry {
    pub name: String,
    pub path: PathBuf,
    pub size: String,
    pub modified: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub exists: bool,
    pub size: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheInfo {
    pub hf_home: CacheEntry,
    pub hf_datasets_cache: CacheEntry,
}

/// Output and cache directories used by quantization runs.
#[derive(Debug, Clone)]
pub struct StorageService {
    out_dir: PathBuf,
    hf_home: PathBuf,
    hf_datasets_cache: PathBuf,
}

impl StorageService {
    /// Creates any of the directories that do not exist yet.
    pub fn new(
        out_dir: impl Into<PathBuf>,
        hf_home: impl Into<PathBuf>,
        hf_datasets_cache: impl Into<PathBuf>,
    ) -> Result<Self> {
        let service = Self {
            out_dir: out_dir.into(),
            hf_home: hf_home.into(),
            hf_datasets_cache: hf_datasets_cache.into(),
        };
        for dir in [&service.out_dir, &service.hf_home, &service.hf_datasets_cache] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(service)
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    /// Sub-directories of the output directory, newest first.
    pub fn list_outputs(&self) -> Result<Vec<OutputEntry>> {
        if !self.out_dir.exists() {
            return Ok(Vec::new());
        }
        let mut outputs: Vec<(Option<SystemTime>, OutputEntry)> = Vec::new();

        let entries = std::fs::read_dir(&self.out_dir)
            .with_context(|| format!("Failed to read {}", self.out_dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified()).ok();
            outputs.push((
                modified,
                OutputEntry {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    size: dir_size_string(&path),
                    modified: modified.map(DateTime::<Local>::from),
                    path,
                },
            ));
        }

        outputs.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(outputs.into_iter().map(|(_, entry)| entry).collect())
    }

    pub fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            hf_home: cache_entry(&self.hf_home),
            hf_datasets_cache: cache_entry(&self.hf_datasets_cache),
        }
    }
}

fn cache_entry(path: &Path) -> CacheEntry {
    let exists = path.exists();
    CacheEntry {
        path: path.to_path_buf(),
        exists,
        size: if exists {
            dir_size_string(path)
        } else {
            format_bytes(0)
        },
    }
}

fn dir_size_string(path: &Path) -> String {
    match dir_size(path) {
        Ok(bytes) => format_bytes(bytes),
        Err(e) => {
            tracing::debug!("Failed to size {}: {}", path.display(), e);
            "Unknown".to_string()
        }
    }
}

/// Total size of regular files below `path`; symlinks are not followed.
pub fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn service(root: &TempDir) -> StorageService {
        StorageService::new(
            root.path().join("out"),
            root.path().join("hf"),
            root.path().join("hf/datasets"),
        )
        .unwrap()
    }

    #[test]
    fn test_new_creates_directories() {
        let root = TempDir::new().unwrap();
        let storage = service(&root);
        assert!(storage.out_dir().is_dir());
        let info = storage.cache_info();
        assert!(info.hf_home.exists);
        assert!(info.hf_datasets_cache.exists);
        assert_eq!(info.hf_datasets_cache.size, "0.0 B");
    }

    #[test]
    fn test_list_outputs_only_directories_with_sizes() {
        let root = TempDir::new().unwrap();
        let storage = service(&root);

        let model = storage.out_dir().join("llama-AWQ");
        fs::create_dir_all(model.join("shards")).unwrap();
        fs::write(model.join("config.json"), vec![0u8; 1000]).unwrap();
        fs::write(model.join("shards/model.bin"), vec![0u8; 1048]).unwrap();
        fs::write(storage.out_dir().join("stray.txt"), "x").unwrap();

        let outputs = storage.list_outputs().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].name, "llama-AWQ");
        assert_eq!(outputs[0].size, "2.0 KB");
        assert!(outputs[0].modified.is_some());
    }

    #[test]
    fn test_list_outputs_newest_first() {
        let root = TempDir::new().unwrap();
        let storage = service(&root);

        let old = storage.out_dir().join("old");
        let new = storage.out_dir().join("new");
        fs::create_dir(&old).unwrap();
        fs::create_dir(&new).unwrap();
        let earlier = SystemTime::now() - std::time::Duration::from_secs(3600);
        fs::File::open(&old).unwrap().set_modified(earlier).unwrap();

        let names: Vec<String> = storage
            .list_outputs()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["new", "old"]);
    }

    #[test]
    fn test_missing_out_dir_lists_nothing() {
        let root = TempDir::new().unwrap();
        let storage = service(&root);
        fs::remove_dir_all(storage.out_dir()).unwrap();
        assert!(storage.list_outputs().unwrap().is_empty());
    }
}
