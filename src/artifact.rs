//! Artifact storage for captured screenshots
//!
//! The engine talks to object storage through the narrow [`ArtifactStore`]
//! trait; keys are deterministic per item and page so retried uploads are
//! idempotent and concurrent uploads never collide.

use crate::error::CaptureError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::PathBuf;
use tokio::fs;

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` at `key`, overwriting any previous upload of the same key.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CaptureError>;

    /// Whether an artifact already exists at `key`. Used to short-circuit
    /// re-uploads when an item is retried after a partial success.
    async fn exists(&self, key: &str) -> Result<bool, CaptureError>;
}

/// Filesystem-backed store; keys become paths under a root directory.
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CaptureError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CaptureError::Upload {
                    key: key.to_string(),
                    reason: e.to_string(),
                })?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| CaptureError::Upload {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn exists(&self, key: &str) -> Result<bool, CaptureError> {
        Ok(fs::try_exists(self.path_for(key)).await.unwrap_or(false))
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: DashMap<String, Vec<u8>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), CaptureError> {
        self.objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CaptureError> {
        Ok(self.objects.contains_key(key))
    }
}
