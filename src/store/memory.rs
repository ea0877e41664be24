use super::archive::Archive;
use super::snapshot::Snapshot;
use super::{
    ArchivalRule, CommitReceipt, DocumentStore, OutcomeCounters, RolloverReport,
};
use crate::config::StoreConfig;
use crate::data_model::{ClaimToken, Document, Outcome, OutcomeKind, PendingMark};
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::query::{Filter, Query};
use crate::utils::prometheus_metrics::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Times a claim re-scans after losing a race before reporting "no document".
const CLAIM_ATTEMPTS: usize = 3;

/// Active documents in insertion order.
#[derive(Debug, Default)]
struct ActiveSet {
    docs: BTreeMap<u64, Document>,
    index: HashMap<String, u64>,
    next_seq: u64,
}

impl ActiveSet {
    fn get(&self, id: &str) -> Option<&Document> {
        self.index.get(id).and_then(|seq| self.docs.get(seq))
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Document> {
        match self.index.get(id) {
            Some(seq) => self.docs.get_mut(seq),
            None => None,
        }
    }

    fn push(&mut self, doc: Document) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(doc.id.clone(), seq);
        self.docs.insert(seq, doc);
    }

    fn remove(&mut self, id: &str) -> Option<Document> {
        let seq = self.index.remove(id)?;
        self.docs.remove(&seq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimMode {
    /// Never claimed by the stage, or its lease expired.
    Fresh,
    /// Last claimed by the stage at least this long ago, touched or not.
    Recurring(Duration),
}

fn held_for(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    now.signed_duration_since(since)
        .to_std()
        .unwrap_or(Duration::ZERO)
}

/// Whether `stage` may claim `doc` at `now`.
///
/// A document is claimable when it is not pending and the stage holds no claim on it,
/// or when that claim is older than the lease and the stage has not touched the document since.
fn is_claimable(doc: &Document, stage: &str, now: DateTime<Utc>, lease: Option<Duration>) -> bool {
    if doc.is_pending() {
        return false;
    }
    let Some(fetched_at) = doc.metadata.fetched.get(stage) else {
        return true;
    };
    let Some(lease) = lease else {
        return false;
    };
    doc.has_open_claim(stage) && held_for(now, *fetched_at) >= lease
}

fn is_due_again(doc: &Document, stage: &str, now: DateTime<Utc>, interval: Duration) -> bool {
    !doc.is_pending()
        && doc
            .metadata
            .fetched
            .get(stage)
            .is_some_and(|fetched_at| held_for(now, *fetched_at) >= interval)
}

/// Fails unless `token` names `stage`'s open claim on `doc`.
fn check_claim(doc: &Document, stage: &str, token: Option<ClaimToken>) -> Result<()> {
    if token.is_some() && doc.has_open_claim(stage) && doc.claim_token(stage) == token {
        return Ok(());
    }
    CLAIMS_REJECTED_TOTAL.inc();
    debug!(doc_id = %doc.id, stage = %stage, "Rejected call without the current claim");
    Err(PipelineError::ClaimLost(format!(
        "document '{}' is not held by stage '{}' under this claim",
        doc.id, stage
    )))
}

fn clear_pending(doc: &mut Document, stage: &str) {
    if doc
        .metadata
        .pending
        .as_ref()
        .is_some_and(|p| p.stage == stage)
    {
        doc.metadata.pending = None;
    }
}

/// In-memory document store with an optional JSON snapshot on disk.
///
/// The active set and the archive sit behind separate locks. When an operation
/// needs both it takes the active set first, so a document moving to the archive
/// is never visible in both places or in neither.
pub struct MemoryStore {
    active: RwLock<ActiveSet>,
    archive: Mutex<Archive>,
    pipeline: RwLock<Option<Pipeline>>,
    rule: ArchivalRule,
    lease: Option<Duration>,
    snapshot_path: Option<PathBuf>,
    dirty: AtomicBool,
    processed: AtomicU64,
    discarded: AtomicU64,
    failed: AtomicU64,
    evicted: AtomicU64,
}

impl MemoryStore {
    pub fn new(config: &StoreConfig) -> Self {
        MemoryStore {
            active: RwLock::new(ActiveSet::default()),
            archive: Mutex::new(Archive::new(
                config.archive_max_count,
                config.archive_max_bytes,
            )),
            pipeline: RwLock::new(None),
            rule: ArchivalRule {
                policy: config.archive_policy.clone(),
                consumed_deletes: config.archive_consumed_deletes,
            },
            lease: config.lease_timeout(),
            snapshot_path: config.snapshot_path.clone(),
            dirty: AtomicBool::new(false),
            processed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Creates the store and restores the snapshot at `config.snapshot_path`, if one exists.
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let store = MemoryStore::new(config);
        let Some(path) = &store.snapshot_path else {
            return Ok(store);
        };
        let Some(snapshot) = Snapshot::read(path).await? else {
            info!(path = %path.display(), "No snapshot found, starting empty");
            return Ok(store);
        };

        {
            let mut active = store.active.write().await;
            for doc in snapshot.active {
                if active.index.contains_key(&doc.id) {
                    warn!(doc_id = %doc.id, "Snapshot lists a document twice, keeping the first");
                    continue;
                }
                active.push(doc);
            }
            let mut archive = store.archive.lock().await;
            for doc in snapshot.archive {
                if active.index.contains_key(&doc.id) || archive.contains(&doc.id) {
                    warn!(doc_id = %doc.id, "Snapshot archive repeats a known document, skipping");
                    continue;
                }
                archive.push(doc);
            }
            archive.enforce_bounds();
        }
        *store.pipeline.write().await = snapshot.pipeline;
        store.processed.store(snapshot.counters.processed, Ordering::Relaxed);
        store.discarded.store(snapshot.counters.discarded, Ordering::Relaxed);
        store.failed.store(snapshot.counters.failed, Ordering::Relaxed);
        store.evicted.store(snapshot.counters.evicted, Ordering::Relaxed);
        info!(
            path = %path.display(),
            active = store.active.read().await.docs.len(),
            archived = store.archive.lock().await.len(),
            "Restored store snapshot"
        );
        Ok(store)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    async fn refresh_gauges(&self, active_len: usize) {
        ACTIVE_DOCUMENTS.set(active_len as f64);
        let archive = self.archive.lock().await;
        ARCHIVED_DOCUMENTS.set(archive.len() as f64);
        ARCHIVE_BYTES.set(archive.total_bytes() as f64);
    }

    fn eligible(&self, doc: &Document, stage: &str, now: DateTime<Utc>, mode: ClaimMode) -> bool {
        match mode {
            ClaimMode::Fresh => is_claimable(doc, stage, now, self.lease),
            ClaimMode::Recurring(interval) => is_due_again(doc, stage, now, interval),
        }
    }

    /// Oldest matching document `stage` may claim, scanned under the read lock.
    async fn find_candidate(&self, filter: &Filter, stage: &str, mode: ClaimMode) -> Option<String> {
        let now = Utc::now();
        let active = self.active.read().await;
        active
            .docs
            .values()
            .find(|d| filter.matches(d) && self.eligible(d, stage, now, mode))
            .map(|d| d.id.clone())
    }

    /// Re-checks the candidate under the write lock and tags it.
    async fn try_tag(&self, id: &str, filter: &Filter, stage: &str, mode: ClaimMode) -> Result<Document> {
        let now = Utc::now();
        let mut active = self.active.write().await;
        let doc = match active.get_mut(id) {
            Some(doc) if filter.matches(doc) && self.eligible(doc, stage, now, mode) => doc,
            _ => {
                return Err(PipelineError::ClaimConflict {
                    id: id.to_string(),
                    stage: stage.to_string(),
                })
            }
        };
        // A new claim always gets a token later than the claim and touch it replaces.
        let floor = doc
            .metadata
            .fetched
            .get(stage)
            .into_iter()
            .chain(doc.metadata.touched.get(stage))
            .max()
            .map(|latest| *latest + chrono::Duration::nanoseconds(1));
        if doc.metadata.fetched.contains_key(stage) {
            match mode {
                ClaimMode::Fresh => {
                    warn!(doc_id = %id, stage = %stage, "Reclaiming document after lease expiry");
                    LEASES_EXPIRED_TOTAL.inc();
                }
                ClaimMode::Recurring(_) => {
                    debug!(doc_id = %id, stage = %stage, "Reissuing recurring claim");
                    CLAIMS_REISSUED_TOTAL.inc();
                }
            }
        }
        let stamp = floor.map_or(now, |floor| now.max(floor));
        doc.metadata.fetched.insert(stage.to_string(), stamp);
        Ok(doc.clone())
    }

    async fn claim(&self, query: &Query, stage: &str, mode: ClaimMode) -> Result<Option<Document>> {
        let filter = query.compile()?;
        let timer = CLAIM_DURATION_SECONDS.start_timer();
        for attempt in 1..=CLAIM_ATTEMPTS {
            let Some(id) = self.find_candidate(&filter, stage, mode).await else {
                break;
            };
            match self.try_tag(&id, &filter, stage, mode).await {
                Ok(doc) => {
                    timer.observe_duration();
                    CLAIMS_TOTAL.inc();
                    self.mark_dirty();
                    debug!(doc_id = %doc.id, stage = %stage, "Claimed document");
                    return Ok(Some(doc));
                }
                Err(PipelineError::ClaimConflict { id, .. }) => {
                    CLAIM_CONFLICTS_TOTAL.inc();
                    debug!(doc_id = %id, stage = %stage, attempt, "Lost claim race, rescanning");
                }
                Err(e) => return Err(e),
            }
        }
        timer.observe_duration();
        CLAIM_MISSES_TOTAL.inc();
        Ok(None)
    }

    /// Ends `stage`'s claim on `incoming`, removes the document from the active set
    /// (committing its payload) and archives it stamped with `kind`.
    async fn finish(&self, incoming: Document, stage: &str, kind: OutcomeKind) -> Result<()> {
        let now = Utc::now();
        let mut active = self.active.write().await;
        let stored = active
            .get(&incoming.id)
            .ok_or_else(|| PipelineError::DocumentNotFound(incoming.id.clone()))?;
        check_claim(stored, stage, incoming.claim_token(stage))?;
        let mut doc = active
            .remove(&incoming.id)
            .ok_or_else(|| PipelineError::DocumentNotFound(incoming.id.clone()))?;
        apply_commit(&mut doc, incoming, stage, now);
        doc.metadata.outcome = Some(Outcome {
            kind,
            stage: stage.to_string(),
            at: now,
        });

        let mut archive = self.archive.lock().await;
        let mut evicted = archive.push(doc);
        evicted += archive.enforce_bounds();
        drop(archive);
        let active_len = active.docs.len();
        drop(active);

        self.evicted.fetch_add(evicted as u64, Ordering::Relaxed);
        EVICTED_DOCUMENTS_TOTAL.inc_by(evicted as f64);
        self.mark_dirty();
        self.refresh_gauges(active_len).await;
        Ok(())
    }
}

/// Copies what a stage may change into the stored document and marks it touched.
fn apply_commit(stored: &mut Document, incoming: Document, stage: &str, now: DateTime<Utc>) {
    stored.contents = incoming.contents;
    stored.action = incoming.action;
    for (key, value) in incoming.metadata.extra {
        stored.metadata.extra.insert(key, value);
    }
    clear_pending(stored, stage);
    // The touch must not predate the claim it closes.
    let at = stored
        .metadata
        .fetched
        .get(stage)
        .map_or(now, |fetched| now.max(*fetched));
    touch(stored, stage, at);
}

fn touch(doc: &mut Document, stage: &str, now: DateTime<Utc>) {
    let entry = doc
        .metadata
        .touched
        .entry(stage.to_string())
        .or_insert(now);
    if *entry < now {
        *entry = now;
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn insert(&self, mut doc: Document) -> Result<String> {
        if doc.id.is_empty() {
            doc.id = Uuid::new_v4().to_string();
        }
        doc.metadata.touched.clear();
        doc.metadata.fetched.clear();
        doc.metadata.outcome = None;
        doc.metadata.pending = None;

        let id = doc.id.clone();
        let active_len = {
            let mut active = self.active.write().await;
            // Checked under the active lock: rollover moves documents while holding it.
            if active.index.contains_key(&id) || self.archive.lock().await.contains(&id) {
                return Err(PipelineError::DuplicateId(id));
            }
            active.push(doc);
            active.docs.len()
        };
        DOCUMENTS_INSERTED_TOTAL.inc();
        ACTIVE_DOCUMENTS.set(active_len as f64);
        self.mark_dirty();
        debug!(doc_id = %id, "Inserted document");
        Ok(id)
    }

    async fn claim_and_tag(&self, query: &Query, stage: &str) -> Result<Option<Document>> {
        self.claim(query, stage, ClaimMode::Fresh).await
    }

    async fn claim_recurring(
        &self,
        query: &Query,
        stage: &str,
        interval: Duration,
    ) -> Result<Option<Document>> {
        if let Some(doc) = self.claim(query, stage, ClaimMode::Fresh).await? {
            return Ok(Some(doc));
        }
        self.claim(query, stage, ClaimMode::Recurring(interval)).await
    }

    async fn mark_touched(&self, id: &str, stage: &str) -> Result<()> {
        let mut active = self.active.write().await;
        let doc = active
            .get_mut(id)
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))?;
        touch(doc, stage, Utc::now());
        self.mark_dirty();
        Ok(())
    }

    async fn release(&self, id: &str, stage: &str, token: ClaimToken) -> Result<()> {
        let mut active = self.active.write().await;
        let doc = active
            .get_mut(id)
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))?;
        check_claim(doc, stage, Some(token))?;
        doc.metadata.fetched.remove(stage);
        clear_pending(doc, stage);
        RELEASES_TOTAL.inc();
        self.mark_dirty();
        Ok(())
    }

    async fn mark_pending(&self, id: &str, stage: &str, token: ClaimToken) -> Result<()> {
        let mut active = self.active.write().await;
        let doc = active
            .get_mut(id)
            .ok_or_else(|| PipelineError::DocumentNotFound(id.to_string()))?;
        check_claim(doc, stage, Some(token))?;
        doc.metadata.pending = Some(PendingMark {
            stage: stage.to_string(),
            at: Utc::now(),
        });
        self.mark_dirty();
        debug!(doc_id = %id, stage = %stage, "Document marked pending");
        Ok(())
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn write_partial(&self, doc: Document, stage: &str) -> Result<()> {
        let mut active = self.active.write().await;
        let stored = active
            .get_mut(&doc.id)
            .ok_or_else(|| PipelineError::DocumentNotFound(doc.id.clone()))?;
        check_claim(stored, stage, doc.claim_token(stage))?;
        for (key, value) in doc.contents {
            stored.contents.insert(key, value);
        }
        for (key, value) in doc.metadata.extra {
            stored.metadata.extra.insert(key, value);
        }
        PARTIAL_WRITES_TOTAL.inc();
        self.mark_dirty();
        Ok(())
    }

    #[instrument(skip(self, doc), fields(doc_id = %doc.id))]
    async fn mark_processed(&self, doc: Document, stage: &str) -> Result<CommitReceipt> {
        let pipeline = self.pipeline.read().await;
        let mut active = self.active.write().await;
        let stored = active
            .get_mut(&doc.id)
            .ok_or_else(|| PipelineError::DocumentNotFound(doc.id.clone()))?;
        check_claim(stored, stage, doc.claim_token(stage))?;
        apply_commit(stored, doc, stage, Utc::now());
        let archivable = self.rule.is_archivable(stored, pipeline.as_ref());
        self.processed.fetch_add(1, Ordering::Relaxed);
        COMMITS_TOTAL.inc();
        self.mark_dirty();
        Ok(CommitReceipt { archivable })
    }

    async fn mark_discarded(&self, doc: Document, stage: &str) -> Result<()> {
        self.finish(doc, stage, OutcomeKind::Discarded).await?;
        self.discarded.fetch_add(1, Ordering::Relaxed);
        DISCARDS_TOTAL.inc();
        Ok(())
    }

    async fn mark_failed(&self, doc: Document, stage: &str) -> Result<()> {
        self.finish(doc, stage, OutcomeKind::Failed).await?;
        self.failed.fetch_add(1, Ordering::Relaxed);
        FAILURES_TOTAL.inc();
        Ok(())
    }

    async fn get_document(&self, query: &Query) -> Result<Option<Document>> {
        Ok(self.get_documents(query, 1, 0).await?.into_iter().next())
    }

    async fn get_documents(&self, query: &Query, limit: usize, skip: usize) -> Result<Vec<Document>> {
        let filter = query.compile()?;
        let active = self.active.read().await;
        Ok(active
            .docs
            .values()
            .filter(|d| filter.matches(d))
            .skip(skip)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn get_document_by_id(&self, id: &str, include_archived: bool) -> Result<Option<Document>> {
        if let Some(doc) = self.active.read().await.get(id) {
            return Ok(Some(doc.clone()));
        }
        if include_archived {
            return Ok(self.archive.lock().await.get(id).cloned());
        }
        Ok(None)
    }

    async fn count_documents(&self, query: &Query) -> Result<usize> {
        let filter = query.compile()?;
        let active = self.active.read().await;
        Ok(active.docs.values().filter(|d| filter.matches(d)).count())
    }

    async fn active_size(&self) -> Result<usize> {
        Ok(self.active.read().await.docs.len())
    }

    async fn archive_size(&self) -> Result<usize> {
        Ok(self.archive.lock().await.len())
    }

    async fn archive_bytes(&self) -> Result<usize> {
        Ok(self.archive.lock().await.total_bytes())
    }

    #[instrument(skip(self))]
    async fn rollover(&self) -> Result<RolloverReport> {
        let pipeline = self.pipeline.read().await.clone();
        let mut active = self.active.write().await;
        let eligible: Vec<u64> = active
            .docs
            .iter()
            .filter(|(_, d)| self.rule.is_archivable(d, pipeline.as_ref()))
            .map(|(seq, _)| *seq)
            .collect();
        let mut report = RolloverReport::default();
        {
            let mut archive = self.archive.lock().await;
            for seq in eligible {
                let Some(mut doc) = active.docs.remove(&seq) else {
                    continue;
                };
                active.index.remove(&doc.id);
                let last_touch = doc
                    .metadata
                    .touched
                    .iter()
                    .max_by_key(|(_, at)| **at)
                    .map(|(s, at)| (s.clone(), *at));
                match last_touch {
                    Some((stage, at)) if doc.metadata.outcome.is_none() => {
                        doc.metadata.outcome = Some(Outcome {
                            kind: OutcomeKind::Processed,
                            stage,
                            at,
                        });
                    }
                    _ => {}
                }
                report.archived += 1;
                report.evicted += archive.push(doc);
            }
            report.evicted += archive.enforce_bounds();
        }
        let active_len = active.docs.len();
        drop(active);

        if report.archived > 0 || report.evicted > 0 {
            self.evicted
                .fetch_add(report.evicted as u64, Ordering::Relaxed);
            ARCHIVED_DOCUMENTS_TOTAL.inc_by(report.archived as f64);
            EVICTED_DOCUMENTS_TOTAL.inc_by(report.evicted as f64);
            self.mark_dirty();
            info!(
                archived = report.archived,
                evicted = report.evicted,
                active = active_len,
                "Rollover complete"
            );
        }
        self.refresh_gauges(active_len).await;
        Ok(report)
    }

    async fn touch_counts(&self) -> Result<BTreeMap<String, u64>> {
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        {
            let active = self.active.read().await;
            for doc in active.docs.values() {
                for stage in doc.metadata.touched.keys() {
                    *counts.entry(stage.clone()).or_default() += 1;
                }
            }
        }
        let archive = self.archive.lock().await;
        for doc in archive.documents() {
            for stage in doc.metadata.touched.keys() {
                *counts.entry(stage.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn counters(&self) -> Result<OutcomeCounters> {
        Ok(OutcomeCounters {
            processed: self.processed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        })
    }

    async fn load_pipeline(&self) -> Result<Option<Pipeline>> {
        Ok(self.pipeline.read().await.clone())
    }

    async fn save_pipeline(&self, mut pipeline: Pipeline) -> Result<u64> {
        pipeline.validate()?;
        let mut current = self.pipeline.write().await;
        let version = current.as_ref().map(|p| p.version).unwrap_or(0) + 1;
        pipeline.version = version;
        info!(pipeline = %pipeline.name, version, "Saved pipeline");
        *current = Some(pipeline);
        self.mark_dirty();
        Ok(version)
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let (active, archive) = {
            let active = self.active.read().await;
            let archive = self.archive.lock().await;
            let active: Vec<Document> = active.docs.values().cloned().collect();
            let archive: Vec<Document> = archive.documents().cloned().collect();
            (active, archive)
        };
        let snapshot = Snapshot {
            active,
            archive,
            pipeline: self.pipeline.read().await.clone(),
            counters: self.counters().await?,
        };
        if let Err(e) = snapshot.write(path).await {
            // Keep the changes pending so the next flush retries.
            self.mark_dirty();
            return Err(e);
        }
        debug!(path = %path.display(), "Snapshot written");
        Ok(())
    }
}
