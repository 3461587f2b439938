//! Filesystem-backed storage client.
//!
//! Maps each location name to a root directory. Object paths are relative,
//! `/`-separated paths under that root.

use super::StorageLocationClient;
use crate::error::{DroverError, Result};
use crate::model::ObjectMeta;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Storage client serving locations from local directories.
#[derive(Debug, Default)]
pub struct LocalStorageClient {
    roots: HashMap<String, PathBuf>,
}

impl LocalStorageClient {
    pub fn new() -> Self {
        Self {
            roots: HashMap::new(),
        }
    }

    /// Register a location backed by the given root directory.
    ///
    /// The directory is created on first write if it does not exist.
    pub fn with_location(mut self, name: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        self.roots.insert(name.into(), root.into());
        self
    }

    fn root(&self, location: &str) -> Result<&PathBuf> {
        self.roots
            .get(location)
            .ok_or_else(|| DroverError::UnknownLocation(location.to_string()))
    }

    fn full_path(&self, location: &str, path: &str) -> Result<PathBuf> {
        let mut full = self.root(location)?.clone();
        for segment in path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return Err(DroverError::storage(
                    location,
                    path,
                    "path segments must be plain names",
                ));
            }
            full.push(segment);
        }
        Ok(full)
    }

    fn relative_path(root: &Path, full: &Path) -> Option<String> {
        let rel = full.strip_prefix(root).ok()?;
        let joined = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Some(joined)
    }

    fn modified_time(meta: &std::fs::Metadata) -> DateTime<Utc> {
        meta.modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now())
    }
}

#[async_trait]
impl StorageLocationClient for LocalStorageClient {
    async fn list(&self, location: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let root = self.root(location)?.clone();
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut objects = Vec::new();
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(rel) = Self::relative_path(&root, entry.path()) else {
                continue;
            };
            if !rel.starts_with(prefix) {
                continue;
            }
            let meta = entry
                .metadata()
                .map_err(|e| DroverError::storage(location, &rel, e.to_string()))?;
            objects.push(ObjectMeta {
                location: location.to_string(),
                path: rel,
                size: meta.len(),
                modified_at: Self::modified_time(&meta),
            });
        }

        // Deterministic listing order keeps batch boundaries stable.
        objects.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(location, prefix, count = objects.len(), "listed location");
        Ok(objects)
    }

    async fn read(&self, location: &str, path: &str) -> Result<Vec<u8>> {
        let full = self.full_path(location, path)?;
        if !full.exists() {
            return Err(DroverError::ObjectNotFound {
                location: location.to_string(),
                path: path.to_string(),
            });
        }
        std::fs::read(&full).map_err(|e| DroverError::Storage {
            location: location.to_string(),
            path: path.to_string(),
            message: format!("read failed: {}", e),
            source: Some(e),
        })
    }

    async fn write(&self, location: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let full = self.full_path(location, path)?;
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DroverError::storage(location, path, e.to_string()))?;
        }
        std::fs::write(&full, bytes).map_err(|e| DroverError::Storage {
            location: location.to_string(),
            path: path.to_string(),
            message: format!("write failed: {}", e),
            source: Some(e),
        })
    }

    async fn exists(&self, location: &str, path: &str) -> Result<bool> {
        Ok(self.full_path(location, path)?.is_file())
    }

    async fn delete(&self, location: &str, path: &str) -> Result<()> {
        let full = self.full_path(location, path)?;
        if !full.exists() {
            return Err(DroverError::ObjectNotFound {
                location: location.to_string(),
                path: path.to_string(),
            });
        }
        std::fs::remove_file(&full).map_err(|e| DroverError::Storage {
            location: location.to_string(),
            path: path.to_string(),
            message: format!("delete failed: {}", e),
            source: Some(e),
        })
    }

    async fn rename(&self, location: &str, from: &str, to: &str) -> Result<()> {
        let src = self.full_path(location, from)?;
        let dst = self.full_path(location, to)?;
        if !src.exists() {
            return Err(DroverError::ObjectNotFound {
                location: location.to_string(),
                path: from.to_string(),
            });
        }
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DroverError::storage(location, to, e.to_string()))?;
        }
        std::fs::rename(&src, &dst).map_err(|e| DroverError::Storage {
            location: location.to_string(),
            path: from.to_string(),
            message: format!("rename to {} failed: {}", to, e),
            source: Some(e),
        })
    }
}
