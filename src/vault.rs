// Local vault filesystem access.
//
// All paths the engine reasons about are vault-relative with forward slashes;
// this module is the only place that maps them onto the host filesystem.
// Writes are staged to a temp file and renamed so a crash never leaves a
// half-written note in the vault.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Path escapes the vault: {0}")]
    PathEscape(String),
}

/// Metadata of one local file, as observed during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    /// Vault-relative path with `/` separators.
    pub path: String,
    pub mtime_ms: i64,
    pub size: u64,
}

/// Local vault root plus path mapping helpers.
#[derive(Debug, Clone)]
pub struct Vault {
    root: PathBuf,
}

impl Vault {
    pub fn new(root: PathBuf) -> Self {
        Vault { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn absolute(&self, rel: &str) -> Result<PathBuf, VaultError> {
        if rel.split('/').any(|part| part == "..") {
            return Err(VaultError::PathEscape(rel.to_string()));
        }
        Ok(self.root.join(rel))
    }

    /// Walk the whole tree and return every regular file.
    ///
    /// The walk itself is blocking, so it runs on the blocking pool; callers
    /// filter the result through the path filter.
    pub async fn scan(&self) -> Result<Vec<LocalFile>, VaultError> {
        let root = self.root.clone();
        let files = tokio::task::spawn_blocking(move || scan_blocking(&root))
            .await
            .map_err(|e| std::io::Error::other(format!("scan task failed: {e}")))??;
        Ok(files)
    }

    /// mtime/size of one file, or `None` when it does not exist.
    pub async fn stat(&self, rel: &str) -> Result<Option<(i64, u64)>, VaultError> {
        let abs = self.absolute(rel)?;
        match tokio::fs::metadata(&abs).await {
            Ok(meta) if meta.is_file() => Ok(Some((mtime_ms_of(&meta), meta.len()))),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read(&self, rel: &str) -> Result<Vec<u8>, VaultError> {
        let abs = self.absolute(rel)?;
        Ok(tokio::fs::read(&abs).await?)
    }

    /// Write a file atomically: stage to `<name>.sync-tmp` next to the
    /// target, then rename over it.
    pub async fn write_atomic(&self, rel: &str, data: &[u8]) -> Result<(), VaultError> {
        let abs = self.absolute(rel)?;
        if let Some(parent) = abs.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staged = abs.with_extension(match abs.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{ext}.sync-tmp"),
            None => "sync-tmp".to_string(),
        });
        tokio::fs::write(&staged, data).await?;
        tokio::fs::rename(&staged, &abs).await?;
        Ok(())
    }

    pub async fn remove(&self, rel: &str) -> Result<(), VaultError> {
        let abs = self.absolute(rel)?;
        match tokio::fs::remove_file(&abs).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, rel: &str) -> bool {
        match self.absolute(rel) {
            Ok(abs) => tokio::fs::try_exists(&abs).await.unwrap_or(false),
            Err(_) => false,
        }
    }
}

fn scan_blocking(root: &Path) -> Result<Vec<LocalFile>, std::io::Error> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = match entry.path().strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => continue,
        };
        let rel = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if rel.ends_with(".sync-tmp") {
            continue;
        }
        let meta = entry.metadata().map_err(std::io::Error::other)?;
        files.push(LocalFile {
            path: rel,
            mtime_ms: mtime_ms_of(&meta),
            size: meta.len(),
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn mtime_ms_of(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
