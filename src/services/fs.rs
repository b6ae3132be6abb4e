//! Share filesystem access
//!
//! The catalog only needs to list directories and stream file bytes from a
//! share. [ShareFileSystem] is that seam; [LocalFileSystem] serves shares
//! that are mounted locally (the watched roots).

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::io::AsyncRead;
use walkdir::WalkDir;

use crate::config::WatchedRoot;
use crate::error::{CatalogError, Result};

/// A file or directory on a share. `path` is relative to the share root and
/// starts with `/`.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub size: u64,
    /// Lowercased, with the leading dot (".mkv")
    pub extension: Option<String>,
    pub is_directory: bool,
    pub modified_at: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn file(path: &str, size: u64) -> Self {
        let name = file_name(path).to_string();
        Self {
            extension: file_extension(&name),
            name,
            path: path.to_string(),
            size,
            is_directory: false,
            modified_at: None,
        }
    }

    pub fn directory(path: &str) -> Self {
        Self {
            name: file_name(path).to_string(),
            path: path.to_string(),
            size: 0,
            extension: None,
            is_directory: true,
            modified_at: None,
        }
    }
}

/// Final component of a share-relative path
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or(path)
}

/// Parent directory of a share-relative path ("/a/b.mkv" -> "/a", "/b.mkv" -> "/")
pub fn parent_dir(path: &str) -> String {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) | None => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
    }
}

pub fn file_extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(format!(".{}", ext.to_lowercase()))
}

/// Listing and byte access for shares
#[async_trait]
pub trait ShareFileSystem: Send + Sync + 'static {
    /// Direct children of `path`, directories included
    async fn list_directory(&self, smb_root: &str, path: &str) -> Result<Vec<FileEntry>>;

    /// Stream the bytes of a file
    async fn open_for_read(
        &self,
        smb_root: &str,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>>;

    /// Entry for a single path, `None` when it no longer exists
    async fn stat(&self, smb_root: &str, path: &str) -> Result<Option<FileEntry>>;

    /// Every directory under the share that directly contains files
    async fn content_directories(&self, smb_root: &str) -> Result<Vec<String>>;
}

/// Shares mounted on the local filesystem
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    roots: HashMap<String, PathBuf>,
}

impl LocalFileSystem {
    pub fn new<'a>(roots: impl IntoIterator<Item = &'a WatchedRoot>) -> Self {
        Self {
            roots: roots
                .into_iter()
                .map(|r| (r.name.clone(), r.local_path.clone()))
                .collect(),
        }
    }

    pub fn with_root(mut self, name: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        self.roots.insert(name.into(), local_path.into());
        self
    }

    /// Map a share path onto the local disk. Paths may not escape the root.
    pub fn resolve(&self, smb_root: &str, path: &str) -> Result<PathBuf> {
        let base = self
            .roots
            .get(smb_root)
            .ok_or_else(|| CatalogError::not_found(format!("share root '{}'", smb_root)))?;
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(CatalogError::not_found(format!("path '{}' in '{}'", path, smb_root)));
        }
        Ok(base.join(relative))
    }

    fn to_entry(relative: String, metadata: &std::fs::Metadata) -> FileEntry {
        let mut entry = if metadata.is_dir() {
            FileEntry::directory(&relative)
        } else {
            FileEntry::file(&relative, metadata.len())
        };
        entry.modified_at = metadata
            .modified()
            .ok()
            .map(DateTime::<Utc>::from);
        entry
    }
}

/// Share-relative form of `abs` under `base`, with a leading `/`
pub fn relative_path(base: &Path, abs: &Path) -> Option<String> {
    let rel = abs.strip_prefix(base).ok()?;
    let joined = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Some(format!("/{}", joined))
}

#[async_trait]
impl ShareFileSystem for LocalFileSystem {
    async fn list_directory(&self, smb_root: &str, path: &str) -> Result<Vec<FileEntry>> {
        let dir = self.resolve(smb_root, path)?;
        let prefix = path.trim_end_matches('/');
        let mut read_dir = fs::read_dir(&dir).await?;
        let mut entries = Vec::new();

        while let Some(entry) = read_dir.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().to_string();
            entries.push(Self::to_entry(format!("{}/{}", prefix, name), &metadata));
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn open_for_read(
        &self,
        smb_root: &str,
        path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
        let file = fs::File::open(self.resolve(smb_root, path)?).await?;
        Ok(Box::new(file))
    }

    async fn stat(&self, smb_root: &str, path: &str) -> Result<Option<FileEntry>> {
        let local = self.resolve(smb_root, path)?;
        match fs::metadata(&local).await {
            Ok(metadata) => Ok(Some(Self::to_entry(path.to_string(), &metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn content_directories(&self, smb_root: &str) -> Result<Vec<String>> {
        let base = self.resolve(smb_root, "/")?;
        let dirs = tokio::task::spawn_blocking(move || {
            let mut dirs: Vec<String> = WalkDir::new(&base)
                .follow_links(true)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.path().parent().and_then(|p| relative_path(&base, p)))
                .collect();
            dirs.sort();
            dirs.dedup();
            dirs
        })
        .await
        .map_err(|e| CatalogError::Io(std::io::Error::other(e)))?;
        Ok(dirs)
    }
}
