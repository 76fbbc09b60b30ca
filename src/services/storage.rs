use crate::models::{FileRole, StoredFile};
use chrono::Utc;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to create temp directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Temp path {path} is already taken")]
    Collision { path: PathBuf },

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Allocates request-scoped file paths inside one managed directory.
///
/// Names combine a nanosecond timestamp with 32 random bits. Two concurrent
/// allocations colliding is vanishingly unlikely under normal load, though not
/// cryptographically impossible; `persist` opens with `create_new` so a
/// collision surfaces as [`StorageError::Collision`] instead of clobbering
/// another request's file.
#[derive(Debug, Clone)]
pub struct TempStorage {
    root: PathBuf,
}

impl TempStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory if absent and switches to its absolute path.
    pub async fn ensure_dir(&mut self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        if let Ok(canonical) = tokio::fs::canonicalize(&self.root).await {
            self.root = canonical;
        }
        Ok(())
    }

    /// Returns a fresh path for `role`. Nothing is written yet.
    pub async fn allocate(&self, role: FileRole, extension: &str) -> Result<StoredFile, StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: self.root.clone(),
                source,
            })?;

        Ok(StoredFile {
            path: self.root.join(unique_name(role, extension)),
            created_at: Utc::now(),
            role,
        })
    }

    pub async fn persist(&self, file: &StoredFile, data: &[u8]) -> Result<(), StorageError> {
        let write_err = |source: std::io::Error| StorageError::Write {
            path: file.path.clone(),
            source,
        };

        let mut handle = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&file.path)
            .await
            .map_err(|source| match source.kind() {
                std::io::ErrorKind::AlreadyExists => StorageError::Collision {
                    path: file.path.clone(),
                },
                _ => write_err(source),
            })?;
        handle.write_all(data).await.map_err(write_err)?;
        handle.flush().await.map_err(write_err)?;
        Ok(())
    }
}

pub fn unique_name(role: FileRole, extension: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let suffix: u32 = rand::thread_rng().r#gen();

    if extension.is_empty() {
        format!("{}-{}-{:08x}", role, nanos, suffix)
    } else {
        format!("{}-{}-{:08x}.{}", role, nanos, suffix, extension)
    }
}
