use super::OutcomeCounters;
use crate::data_model::Document;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// On-disk image of a store. Active documents are kept in claim (insertion) order.
#[derive(Serialize, Deserialize, Debug, Default)]
pub(crate) struct Snapshot {
    pub active: Vec<Document>,
    pub archive: Vec<Document>,
    #[serde(default)]
    pub pipeline: Option<Pipeline>,
    #[serde(default)]
    pub counters: OutcomeCounters,
}

impl Snapshot {
    pub async fn read(path: &Path) -> Result<Option<Snapshot>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(PipelineError::StoreUnavailable(format!(
                    "Failed to read snapshot '{}': {}",
                    path.display(),
                    e
                )))
            }
        };
        // A corrupt snapshot is malformed persisted state and goes to the operator.
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::ConfigError(format!(
                "Snapshot '{}' is not valid: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(snapshot))
    }

    /// Writes via a temporary file and rename so readers never see a partial snapshot.
    pub async fn write(&self, path: &Path) -> Result<()> {
        let bytes = serde_json::to_vec(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PipelineError::StoreUnavailable(format!(
                    "Failed to create snapshot directory '{}': {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            PipelineError::StoreUnavailable(format!(
                "Failed to write snapshot '{}': {}",
                tmp.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            PipelineError::StoreUnavailable(format!(
                "Failed to replace snapshot '{}': {}",
                path.display(),
                e
            ))
        })?;
        Ok(())
    }
}
