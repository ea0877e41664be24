use crate::error::{PipelineError, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Hex SHA-256 digest, the only accepted artifact id shape.
pub fn is_valid_artifact_id(id: &str) -> bool {
    id.len() == 64 && id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}

pub fn artifact_id(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Content-addressed artifact files in a single directory.
#[derive(Debug, Clone)]
pub struct ArtifactRepository {
    root: PathBuf,
}

impl ArtifactRepository {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            PipelineError::StoreUnavailable(format!(
                "Failed to create artifact directory '{}': {}",
                root.display(),
                e
            ))
        })?;
        info!(path = %root.display(), "Artifact repository ready");
        Ok(ArtifactRepository { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_artifact_id(id) {
            return Err(PipelineError::ArtifactNotFound(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    /// Stores `bytes` and returns their id. Storing the same bytes twice is a no-op.
    pub async fn put(&self, bytes: &[u8]) -> Result<String> {
        let id = artifact_id(bytes);
        let path = self.path_for(&id)?;
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            debug!(artifact = %id, "Artifact already stored");
            return Ok(id);
        }
        let tmp = self.root.join(format!("{}.tmp", id));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| PipelineError::StoreUnavailable(format!("Failed to write artifact: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| PipelineError::StoreUnavailable(format!("Failed to store artifact: {}", e)))?;
        info!(artifact = %id, bytes = bytes.len(), "Stored artifact");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::ArtifactNotFound(id.to_string()))
            }
            Err(e) => Err(PipelineError::StoreUnavailable(format!(
                "Failed to read artifact '{}': {}",
                id, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ArtifactRepository::open(dir.path()).await.unwrap();
        let id = repo.put(b"#!/bin/sh\necho hi\n").await.unwrap();
        assert!(is_valid_artifact_id(&id));
        assert_eq!(repo.put(b"#!/bin/sh\necho hi\n").await.unwrap(), id);
        assert_eq!(repo.get(&id).await.unwrap(), b"#!/bin/sh\necho hi\n");
    }

    #[tokio::test]
    async fn test_rejects_unknown_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let repo = ArtifactRepository::open(dir.path()).await.unwrap();
        assert!(matches!(
            repo.get("../etc/passwd").await,
            Err(PipelineError::ArtifactNotFound(_))
        ));
        let missing = artifact_id(b"never stored");
        assert!(matches!(
            repo.get(&missing).await,
            Err(PipelineError::ArtifactNotFound(_))
        ));
    }
}
