//! Filesystem document source.
//!
//! Walks `source.root` (or a sub-directory of it) applying include and
//! exclude globs. A document's identity is its path relative to the root,
//! with forward slashes, so it stays stable across scans.

use anyhow::{bail, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::traits::{DiscoveredDocument, DocumentSource};

pub struct FilesystemSource {
    root: PathBuf,
    include_set: GlobSet,
    exclude_set: GlobSet,
    follow_symlinks: bool,
}

impl FilesystemSource {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        let include_set = build_globset(&config.include_globs)?;

        let mut default_excludes = vec!["**/.git/**".to_string(), "**/~$*".to_string()];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude_set = build_globset(&default_excludes)?;

        Ok(Self {
            root: config.root.clone(),
            include_set,
            exclude_set,
            follow_symlinks: config.follow_symlinks,
        })
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf, SourceError> {
        let rel = Path::new(relative);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SourceError::NotFound(format!(
                "{} escapes the source root",
                relative
            )));
        }
        Ok(self.root.join(rel))
    }

    fn walk(&self, dir: &Path) -> Result<Vec<DiscoveredDocument>, SourceError> {
        let mut items = Vec::new();

        let walker = WalkDir::new(dir).follow_links(self.follow_symlinks);
        for entry in walker {
            let entry = entry.map_err(|e| SourceError::Unavailable(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            // Apply exclude patterns
            if self.exclude_set.is_match(&rel_str) {
                continue;
            }

            // Apply include patterns
            if !self.include_set.is_match(&rel_str) {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| SourceError::Unavailable(e.to_string()))?;
            let modified_at = metadata
                .modified()
                .ok()
                .and_then(|m| m.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_secs() as i64);

            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| rel_str.clone());

            items.push(DiscoveredDocument {
                identity: rel_str.clone(),
                name,
                path: Some(rel_str),
                fingerprint: None,
                size_bytes: metadata.len() as i64,
                modified_at,
            });
        }

        // Sort for deterministic ordering
        items.sort_by(|a, b| a.identity.cmp(&b.identity));

        Ok(items)
    }
}

#[async_trait]
impl DocumentSource for FilesystemSource {
    async fn list(&self, container: &str) -> Result<Vec<DiscoveredDocument>, SourceError> {
        let dir = self.resolve(container)?;
        if !dir.exists() {
            return Err(SourceError::NotFound(format!(
                "source directory does not exist: {}",
                dir.display()
            )));
        }
        self.walk(&dir)
    }

    async fn fetch(&self, identity: &str) -> Result<Vec<u8>, SourceError> {
        let path = self.resolve(identity)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(SourceError::NotFound(identity.to_string()))
            }
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    if patterns.is_empty() {
        bail!("at least one glob pattern is required");
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
