use crate::error::Result;
use crate::store::DocumentStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aggregate view of the store, computed on demand and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub active_count: usize,
    pub archive_count: usize,
    pub archive_bytes: usize,
    pub per_stage_touched: BTreeMap<String, u64>,
    pub processed: u64,
    pub discarded: u64,
    pub failed: u64,
    pub evicted: u64,
    /// Version of the deployed pipeline, 0 when none is stored.
    pub pipeline_version: u64,
}

pub struct StatusTracker;

impl StatusTracker {
    pub async fn snapshot(store: &dyn DocumentStore) -> Result<PipelineStatus> {
        let counters = store.counters().await?;
        let pipeline_version = store
            .load_pipeline()
            .await?
            .map(|p| p.version)
            .unwrap_or(0);
        Ok(PipelineStatus {
            active_count: store.active_size().await?,
            archive_count: store.archive_size().await?,
            archive_bytes: store.archive_bytes().await?,
            per_stage_touched: store.touch_counts().await?,
            processed: counters.processed,
            discarded: counters.discarded,
            failed: counters.failed,
            evicted: counters.evicted,
            pipeline_version,
        })
    }
}
