use crate::data_model::Document;
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

/// One unit of document transformation inside a stage worker.
#[async_trait]
pub trait ProcessingStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process(&self, document: Document) -> Result<Document>;
}

/// Runs a fixed, ordered list of steps over one document at a time.
pub struct PipelineExecutor {
    steps: Vec<Box<dyn ProcessingStep>>,
}

impl PipelineExecutor {
    pub fn new(steps: Vec<Box<dyn ProcessingStep>>) -> Self {
        if steps.is_empty() {
            warn!("Executor created with no steps.");
        }
        PipelineExecutor { steps }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub async fn run_single_async(&self, initial_document: Document) -> Result<Document> {
        let mut current_doc = initial_document;
        for step in &self.steps {
            debug!(doc_id = %current_doc.id, "Running async step: {}", step.name());
            current_doc = step
                .process(current_doc)
                .await
                .map_err(|e| PipelineError::StepError {
                    step_name: step.name().to_string(),
                    source: Box::new(e),
                })?;
        }
        Ok(current_doc)
    }
}
