use super::DocumentStore;
use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const INDEX_FILE: &str = "index.json";

/// Upper bound on attachment names, in bytes.
pub const MAX_FILE_NAME_LEN: usize = 255;

fn digest(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentInfo {
    pub document_id: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_by_stage: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    pub size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AttachmentIndex {
    document_id: String,
    files: BTreeMap<String, AttachmentInfo>,
}

/// Named files stored alongside documents, one directory per document.
///
/// Directory and blob names are digests of the document id and file name, so
/// neither ever reaches the filesystem as a path.
#[derive(Debug, Clone)]
pub struct AttachmentRepository {
    root: PathBuf,
    index_lock: Arc<Mutex<()>>,
}

fn io_error(what: &str, e: std::io::Error) -> PipelineError {
    PipelineError::StoreUnavailable(format!("Failed to {}: {}", what, e))
}

impl AttachmentRepository {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            PipelineError::StoreUnavailable(format!(
                "Failed to create attachment directory '{}': {}",
                root.display(),
                e
            ))
        })?;
        info!(path = %root.display(), "Attachment repository ready");
        Ok(AttachmentRepository {
            root,
            index_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_for(&self, document_id: &str) -> PathBuf {
        self.root.join(digest(document_id))
    }

    async fn read_index(dir: &Path) -> Result<Option<AttachmentIndex>> {
        match tokio::fs::read(dir.join(INDEX_FILE)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read attachment index", e)),
        }
    }

    async fn write_index(dir: &Path, index: &AttachmentIndex) -> Result<()> {
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(index)?)
            .await
            .map_err(|e| io_error("write attachment index", e))?;
        tokio::fs::rename(&tmp, dir.join(INDEX_FILE))
            .await
            .map_err(|e| io_error("store attachment index", e))
    }

    /// Stores `bytes` as `file_name` of `document_id`, replacing any file of that name.
    pub async fn put(
        &self,
        document_id: &str,
        file_name: &str,
        saved_by_stage: Option<&str>,
        mimetype: Option<&str>,
        bytes: &[u8],
    ) -> Result<AttachmentInfo> {
        if file_name.trim().is_empty()
            || matches!(file_name, "." | "..")
            || file_name.len() > MAX_FILE_NAME_LEN
        {
            return Err(PipelineError::ProtocolError(format!(
                "attachment name must be 1 to {} bytes, not blank and not a dot segment",
                MAX_FILE_NAME_LEN
            )));
        }
        let dir = self.dir_for(document_id);
        let _guard = self.index_lock.lock().await;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create attachment directory", e))?;

        let blob = dir.join(digest(file_name));
        let tmp = dir.join(format!("{}.tmp", digest(file_name)));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error("write attachment", e))?;
        tokio::fs::rename(&tmp, &blob)
            .await
            .map_err(|e| io_error("store attachment", e))?;

        let mut index = Self::read_index(&dir).await?.unwrap_or_default();
        index.document_id = document_id.to_string();
        let info = AttachmentInfo {
            document_id: document_id.to_string(),
            file_name: file_name.to_string(),
            saved_by_stage: saved_by_stage.map(str::to_string),
            uploaded_at: Utc::now(),
            mimetype: mimetype.map(str::to_string),
            size: bytes.len() as u64,
        };
        index.files.insert(file_name.to_string(), info.clone());
        Self::write_index(&dir, &index).await?;
        info!(doc_id = %document_id, file = %file_name, bytes = bytes.len(), "Stored attachment");
        Ok(info)
    }

    /// Attachments of `document_id`, ordered by name.
    pub async fn list(&self, document_id: &str) -> Result<Vec<AttachmentInfo>> {
        let index = Self::read_index(&self.dir_for(document_id)).await?;
        Ok(index
            .map(|i| i.files.into_values().collect())
            .unwrap_or_default())
    }

    pub async fn get(&self, document_id: &str, file_name: &str) -> Result<(AttachmentInfo, Vec<u8>)> {
        let dir = self.dir_for(document_id);
        let info = Self::read_index(&dir)
            .await?
            .and_then(|mut i| i.files.remove(file_name))
            .ok_or_else(|| PipelineError::AttachmentNotFound(file_name.to_string()))?;
        match tokio::fs::read(dir.join(digest(file_name))).await {
            Ok(bytes) => Ok((info, bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PipelineError::AttachmentNotFound(file_name.to_string()))
            }
            Err(e) => Err(io_error("read attachment", e)),
        }
    }

    pub async fn delete(&self, document_id: &str, file_name: &str) -> Result<()> {
        let dir = self.dir_for(document_id);
        let _guard = self.index_lock.lock().await;
        let mut index = Self::read_index(&dir)
            .await?
            .ok_or_else(|| PipelineError::AttachmentNotFound(file_name.to_string()))?;
        if index.files.remove(file_name).is_none() {
            return Err(PipelineError::AttachmentNotFound(file_name.to_string()));
        }
        Self::write_index(&dir, &index).await?;
        if let Err(e) = tokio::fs::remove_file(dir.join(digest(file_name))).await {
            warn!(doc_id = %document_id, file = %file_name, error = %e, "Attachment blob already gone");
        }
        debug!(doc_id = %document_id, file = %file_name, "Deleted attachment");
        Ok(())
    }

    /// Removes the attachments of documents the store no longer holds, active or archived.
    pub async fn prune(&self, store: &dyn DocumentStore) -> Result<usize> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("list attachment directory", e))?;
        let mut removed = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("list attachment directory", e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| io_error("inspect attachment directory", e))?
                .is_dir();
            if !is_dir {
                continue;
            }
            let dir = entry.path();
            let _guard = self.index_lock.lock().await;
            let keep = match Self::read_index(&dir).await? {
                Some(index) => store
                    .get_document_by_id(&index.document_id, true)
                    .await?
                    .is_some(),
                None => false,
            };
            if keep {
                continue;
            }
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|e| io_error("remove attachments", e))?;
            removed += 1;
        }
        if removed > 0 {
            info!(removed, "Pruned attachments of departed documents");
        }
        Ok(removed)
    }
}
