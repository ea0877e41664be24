//! Document storage and the claim primitive.
//!
//! The store owns every document and every metadata mutation. Workers only ever
//! hold a copy of a claimed document between `claim_and_tag` and the matching
//! commit, release or terminal mark.
//!
//! Every call that ends or extends a claim names it by its [`ClaimToken`]. Commits
//! and terminal marks read the token from the document copy they carry; a call whose
//! token is not the stage's open claim fails with `ClaimLost` and changes nothing.

pub mod archive;
pub mod artifacts;
pub mod attachments;
pub mod memory;
mod snapshot;

use crate::data_model::{Action, ClaimToken, Document};
use crate::error::Result;
use crate::pipeline::Pipeline;
use crate::query::Query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use artifacts::ArtifactRepository;
pub use attachments::{AttachmentInfo, AttachmentRepository};
pub use memory::MemoryStore;

/// When a committed document is eligible to leave the active set.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArchivalPolicy {
    /// Every ACTIVE stage of the deployed pipeline has touched it.
    #[default]
    AllActiveStagesTouched,
    /// Every listed stage has touched it.
    StagesTouched(Vec<String>),
    Never,
}

/// The archival policy plus the DELETE-consumed rule, evaluated against a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivalRule {
    pub policy: ArchivalPolicy,
    pub consumed_deletes: bool,
}

impl ArchivalRule {
    pub fn is_archivable(&self, doc: &Document, pipeline: Option<&Pipeline>) -> bool {
        if self.consumed_deletes && doc.action == Action::Delete {
            if let Some(p) = pipeline {
                if p.output_stage_names().iter().any(|s| doc.is_touched_by(s)) {
                    return true;
                }
            }
        }
        match &self.policy {
            ArchivalPolicy::AllActiveStagesTouched => {
                let stages = pipeline.map(|p| p.active_stage_names()).unwrap_or_default();
                !stages.is_empty() && stages.iter().all(|s| doc.is_touched_by(s))
            }
            ArchivalPolicy::StagesTouched(stages) => {
                !stages.is_empty() && stages.iter().all(|s| doc.is_touched_by(s))
            }
            ArchivalPolicy::Never => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitReceipt {
    /// The next rollover will move the document to the archive.
    pub archivable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RolloverReport {
    pub archived: usize,
    pub evicted: usize,
}

/// Cumulative outcome counters since the store was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounters {
    pub processed: u64,
    pub discarded: u64,
    pub failed: u64,
    pub evicted: u64,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Adds a document to the active set, assigning an id when it has none.
    async fn insert(&self, doc: Document) -> Result<String>;

    /// Atomically selects the oldest document matching `query` that `stage`
    /// may claim, and tags it as fetched by `stage`.
    async fn claim_and_tag(&self, query: &Query, stage: &str) -> Result<Option<Document>>;

    /// Like [`DocumentStore::claim_and_tag`], but when nothing fresh matches it reissues
    /// the oldest matching document `stage` last claimed at least `interval` ago,
    /// even one the stage already touched.
    async fn claim_recurring(
        &self,
        query: &Query,
        stage: &str,
        interval: Duration,
    ) -> Result<Option<Document>>;

    async fn mark_touched(&self, id: &str, stage: &str) -> Result<()>;

    /// Drops `stage`'s claim without touching the document.
    async fn release(&self, id: &str, stage: &str, token: ClaimToken) -> Result<()>;

    /// Keeps every stage off the document until the claiming stage commits,
    /// discards, fails or releases it.
    async fn mark_pending(&self, id: &str, stage: &str, token: ClaimToken) -> Result<()>;

    /// Merges the top-level contents and extra metadata keys of `doc` into the stored
    /// document. The claim stays open and the document is not touched.
    async fn write_partial(&self, doc: Document, stage: &str) -> Result<()>;

    /// Commits contents, action and metadata written by `stage` and marks it touched.
    async fn mark_processed(&self, doc: Document, stage: &str) -> Result<CommitReceipt>;

    /// Terminal: archives the document immediately, stamped as discarded.
    async fn mark_discarded(&self, doc: Document, stage: &str) -> Result<()>;

    /// Terminal: archives the document immediately, stamped as failed.
    async fn mark_failed(&self, doc: Document, stage: &str) -> Result<()>;

    async fn get_document(&self, query: &Query) -> Result<Option<Document>>;

    async fn get_documents(&self, query: &Query, limit: usize, skip: usize) -> Result<Vec<Document>>;

    async fn get_document_by_id(&self, id: &str, include_archived: bool) -> Result<Option<Document>>;

    async fn count_documents(&self, query: &Query) -> Result<usize>;

    async fn active_size(&self) -> Result<usize>;

    async fn archive_size(&self) -> Result<usize>;

    async fn archive_bytes(&self) -> Result<usize>;

    /// Moves archivable documents to the archive and restores the archive bounds.
    async fn rollover(&self) -> Result<RolloverReport>;

    /// stage -> number of documents (active or archived) it has touched.
    async fn touch_counts(&self) -> Result<BTreeMap<String, u64>>;

    async fn counters(&self) -> Result<OutcomeCounters>;

    async fn load_pipeline(&self) -> Result<Option<Pipeline>>;

    /// Stores the pipeline, returning its new version.
    async fn save_pipeline(&self, pipeline: Pipeline) -> Result<u64>;

    /// Writes pending changes to durable storage, if any is configured.
    async fn persist(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Stage, StageGroup, StageMode};
    use serde_json::json;

    fn pipeline() -> Pipeline {
        Pipeline::new(
            "p",
            vec![StageGroup::new(
                "g",
                vec![
                    Stage::new("A"),
                    Stage::new("W").with_property("output", true),
                    Stage::new("D").with_mode(StageMode::Debug),
                ],
            )],
        )
    }

    fn touched(stages: &[&str]) -> Document {
        let mut doc = Document::from_value(json!({"a": 1})).with_id("x");
        for s in stages {
            doc.metadata.touched.insert(s.to_string(), chrono::Utc::now());
        }
        doc
    }

    #[test]
    fn test_all_active_stages_ignores_debug() {
        let rule = ArchivalRule {
            policy: ArchivalPolicy::AllActiveStagesTouched,
            consumed_deletes: false,
        };
        let p = pipeline();
        assert!(!rule.is_archivable(&touched(&["A"]), Some(&p)));
        assert!(rule.is_archivable(&touched(&["A", "W"]), Some(&p)));
        assert!(!rule.is_archivable(&touched(&["A", "W"]), None));
    }

    #[test]
    fn test_consumed_delete() {
        let rule = ArchivalRule {
            policy: ArchivalPolicy::Never,
            consumed_deletes: true,
        };
        let p = pipeline();
        let doc = touched(&["W"]).with_action(Action::Delete);
        assert!(rule.is_archivable(&doc, Some(&p)));
        assert!(!rule.is_archivable(&touched(&["W"]), Some(&p)));
    }

    #[test]
    fn test_policy_yaml_forms() {
        let p: ArchivalPolicy = serde_yaml::from_str("all_active_stages_touched").unwrap();
        assert_eq!(p, ArchivalPolicy::AllActiveStagesTouched);
        let p: ArchivalPolicy = serde_yaml::from_str("stages_touched: [A, B]").unwrap();
        assert_eq!(
            p,
            ArchivalPolicy::StagesTouched(vec!["A".to_string(), "B".to_string()])
        );
    }
}
