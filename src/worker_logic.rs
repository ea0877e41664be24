// src/worker_logic.rs

use crate::client::RemotePipeline;
use crate::data_model::{Document, ProcessingOutcome};
use crate::error::{PipelineError, Result};
use crate::executor::PipelineExecutor;
use crate::pipeline::steps::build_steps_from_config;
use crate::pipeline::StageSettings;
use crate::utils::prometheus_metrics::*;
use std::time::Instant;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Decoupled core processing logic for a single claimed document.
///
/// A `DocumentFiltered` raised by any step becomes `Filtered`; every other
/// error becomes `Error`, which the caller answers with a release.
pub async fn execute_processing_pipeline(
    executor: &PipelineExecutor,
    document: Document,
) -> ProcessingOutcome {
    let id = document.id.clone();
    match executor.run_single_async(document).await {
        Ok(processed) => ProcessingOutcome::Success(processed),
        Err(e) => match e.into_root() {
            PipelineError::DocumentFiltered { document, reason } => ProcessingOutcome::Filtered {
                document: *document,
                reason,
            },
            other => ProcessingOutcome::Error {
                id,
                error_message: other.to_string(),
            },
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to claim.
    Idle,
    Committed,
    Discarded,
    Released,
    /// The claim ended while we held it: the lease was reissued to another worker,
    /// or the document left the active set. Nothing to do.
    Lost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub committed: u64,
    pub discarded: u64,
    pub released: u64,
    pub lost: u64,
}

impl WorkerSummary {
    fn record(&mut self, outcome: CycleOutcome) {
        match outcome {
            CycleOutcome::Committed => self.committed += 1,
            CycleOutcome::Discarded => self.discarded += 1,
            CycleOutcome::Released => self.released += 1,
            CycleOutcome::Lost => self.lost += 1,
            CycleOutcome::Idle => {}
        }
    }
}

/// A single stage's claim/process/commit loop against the coordination protocol.
pub struct StageWorker {
    stage: String,
    client: RemotePipeline,
    settings: StageSettings,
    executor: PipelineExecutor,
}

impl StageWorker {
    pub fn new(
        stage: impl Into<String>,
        client: RemotePipeline,
        settings: StageSettings,
        executor: PipelineExecutor,
    ) -> Self {
        StageWorker {
            stage: stage.into(),
            client,
            settings,
            executor,
        }
    }

    /// Fetches the stage's properties from the server and builds a worker from them.
    pub async fn connect(client: RemotePipeline, stage: &str) -> Result<Self> {
        let properties = client.stage_properties(stage).await?;
        let settings = StageSettings::from_properties(&properties)?;
        let steps = build_steps_from_config(&settings.steps)?;
        info!(
            stage = %stage,
            steps = steps.len(),
            hold_ms = settings.hold_interval.as_millis() as u64,
            "Stage worker configured"
        );
        Ok(StageWorker::new(
            stage,
            client,
            settings,
            PipelineExecutor::new(steps),
        ))
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn settings(&self) -> &StageSettings {
        &self.settings
    }

    /// Tolerates a claim that ended or a document that disappeared from the active set.
    fn lost_or<T>(&self, result: Result<T>, id: &str, outcome: CycleOutcome) -> Result<CycleOutcome> {
        match result {
            Ok(_) => Ok(outcome),
            Err(PipelineError::DocumentNotFound(_)) => {
                warn!(doc_id = %id, stage = %self.stage, "Document no longer active, dropping result");
                WORKER_DOCUMENTS_LOST_TOTAL.inc();
                Ok(CycleOutcome::Lost)
            }
            Err(PipelineError::ClaimLost(reason)) => {
                warn!(doc_id = %id, stage = %self.stage, reason = %reason, "Claim no longer held, dropping result");
                WORKER_DOCUMENTS_LOST_TOTAL.inc();
                Ok(CycleOutcome::Lost)
            }
            Err(e) => Err(e),
        }
    }

    async fn claim(&self) -> Result<Option<Document>> {
        let query = &self.settings.subscription;
        match self.settings.recurring_interval {
            Some(interval) => self.client.claim_recurring(&self.stage, query, interval).await,
            None => self.client.claim(&self.stage, query).await,
        }
    }

    /// One claim cycle. Errors are protocol failures that survived the client's retries.
    #[instrument(skip(self), fields(stage = %self.stage))]
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let Some(doc) = self.claim().await? else {
            WORKER_EMPTY_POLLS_TOTAL.inc();
            return Ok(CycleOutcome::Idle);
        };
        let Some(token) = doc.claim_token(&self.stage) else {
            return Err(PipelineError::ProtocolError(format!(
                "claimed document '{}' carries no claim for stage '{}'",
                doc.id, self.stage
            )));
        };

        let timer = WORKER_PROCESSING_DURATION_SECONDS.start_timer();
        let id = doc.id.clone();
        let outcome = match execute_processing_pipeline(&self.executor, doc).await {
            ProcessingOutcome::Success(processed) => {
                let result = self.client.commit(&self.stage, &processed).await;
                let outcome = self.lost_or(result, &id, CycleOutcome::Committed)?;
                if outcome == CycleOutcome::Committed {
                    WORKER_DOCUMENTS_PROCESSED_TOTAL.inc();
                    debug!(doc_id = %id, "Committed document");
                }
                outcome
            }
            ProcessingOutcome::Filtered { document, reason } => {
                info!(doc_id = %id, reason = %reason, "Document discarded by stage");
                let result = self.client.discard(&self.stage, &document).await;
                let outcome = self.lost_or(result, &id, CycleOutcome::Discarded)?;
                if outcome == CycleOutcome::Discarded {
                    WORKER_DOCUMENTS_DISCARDED_TOTAL.inc();
                }
                outcome
            }
            ProcessingOutcome::Error { id, error_message } => {
                warn!(doc_id = %id, error = %error_message, "Processing failed, releasing document");
                let result = self.client.release(&self.stage, &id, token).await;
                let outcome = self.lost_or(result, &id, CycleOutcome::Released)?;
                if outcome == CycleOutcome::Released {
                    WORKER_DOCUMENTS_RELEASED_TOTAL.inc();
                }
                outcome
            }
        };
        timer.observe_duration();
        Ok(outcome)
    }

    async fn heartbeat(&self) {
        match self.client.heartbeat(&self.stage).await {
            Ok(resp) if !resp.stage_known => {
                warn!(stage = %self.stage, "Server does not know this stage as scheduled")
            }
            Ok(resp) => debug!(
                active = resp.status.active_count,
                archived = resp.status.archive_count,
                "Heartbeat acknowledged"
            ),
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }

    /// Runs until `cancel` fires. Cancellation is checked between cycles only, so a
    /// claimed document is always committed, discarded or released before returning.
    pub async fn run(&self, cancel: CancellationToken) -> Result<WorkerSummary> {
        info!(stage = %self.stage, "Stage worker started");
        let mut summary = WorkerSummary::default();
        let mut last_heartbeat: Option<Instant> = None;

        while !cancel.is_cancelled() {
            if last_heartbeat.map_or(true, |t| t.elapsed() >= self.settings.heartbeat_interval) {
                self.heartbeat().await;
                last_heartbeat = Some(Instant::now());
            }

            match self.run_once().await {
                Ok(CycleOutcome::Idle) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(self.settings.hold_interval) => {}
                    }
                }
                Ok(outcome) => summary.record(outcome),
                Err(e) => {
                    error!(stage = %self.stage, error = %e, "Stage worker stopping on protocol error");
                    return Err(e);
                }
            }
        }

        info!(
            stage = %self.stage,
            committed = summary.committed,
            discarded = summary.discarded,
            released = summary.released,
            lost = summary.lost,
            "Stage worker stopped"
        );
        Ok(summary)
    }
}
