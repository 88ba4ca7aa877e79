//! Content-addressed storage for uploaded submissions.

use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use grader_job_queue::ArtifactRef;

use crate::error::ArtifactError;

const SHA256_PREFIX: &str = "sha256:";

/// Where submission payloads live between upload and grading.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` and return a reference to them.
    async fn put(&self, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError>;

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError>;

    /// Path on the local filesystem, when the store keeps one.
    fn local_path(&self, artifact: &ArtifactRef) -> Option<PathBuf>;
}

/// Stores each payload once under `<dir>/<sha256 hex>`.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    dir: PathBuf,
}

impl FsArtifactStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, artifact: &ArtifactRef) -> Result<PathBuf, ArtifactError> {
        let hex = artifact
            .as_str()
            .strip_prefix(SHA256_PREFIX)
            .filter(|h| h.len() == 64 && h.bytes().all(|b| b.is_ascii_hexdigit()))
            .ok_or_else(|| ArtifactError::InvalidRef(artifact.clone()))?;
        Ok(self.dir.join(hex))
    }
}

/// Content address for `bytes`.
pub fn content_ref(bytes: &[u8]) -> ArtifactRef {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    ArtifactRef::new(format!("{SHA256_PREFIX}{}", hex::encode(hasher.finalize())))
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: &[u8]) -> Result<ArtifactRef, ArtifactError> {
        let artifact = content_ref(bytes);
        let path = self.path_for(&artifact)?;
        if fs::try_exists(&path).await? {
            debug!(artifact = %artifact, "artifact already stored");
            return Ok(artifact);
        }

        let tmp = self.dir.join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, &path).await?;
        debug!(artifact = %artifact, size = bytes.len(), "stored artifact");
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ArtifactError> {
        let path = self.path_for(artifact)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ArtifactError::NotFound(artifact.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn local_path(&self, artifact: &ArtifactRef) -> Option<PathBuf> {
        self.path_for(artifact).ok()
    }
}
