use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};
use DocRelay::config::pipeline::{CopyFieldParams, RemoveFieldsParams, SetStaticFieldParams};
use DocRelay::config::StepConfig;
use DocRelay::data_model::Document;
use DocRelay::error::{PipelineError, Result};
use DocRelay::executor::{PipelineExecutor, ProcessingStep};
use DocRelay::pipeline::steps::build_steps_from_config;

fn create_test_document(id: &str) -> Document {
    Document::from_value(json!({"title": "Hello", "tracking": "utm"})).with_id(id)
}

// Records the order steps ran in.
struct RecordingStep {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
}

#[async_trait]
impl ProcessingStep for RecordingStep {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn process(&self, document: Document) -> Result<Document> {
        self.log.lock().unwrap().push(self.name);
        if self.fail {
            return Err(PipelineError::ProcessError {
                step_name: self.name.to_string(),
                message: "Mock error".to_string(),
            });
        }
        Ok(document)
    }
}

fn recording(
    name: &'static str,
    log: &Arc<Mutex<Vec<&'static str>>>,
    fail: bool,
) -> Box<dyn ProcessingStep> {
    Box::new(RecordingStep {
        name,
        log: log.clone(),
        fail,
    })
}

#[tokio::test]
async fn test_steps_run_in_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = PipelineExecutor::new(vec![
        recording("first", &log, false),
        recording("second", &log, false),
        recording("third", &log, false),
    ]);
    assert_eq!(executor.len(), 3);
    let doc = executor
        .run_single_async(create_test_document("d1"))
        .await
        .unwrap();
    assert_eq!(doc.id, "d1");
    assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
}

#[tokio::test]
async fn test_first_error_stops_the_run() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let executor = PipelineExecutor::new(vec![
        recording("first", &log, false),
        recording("broken", &log, true),
        recording("never", &log, false),
    ]);
    match executor.run_single_async(create_test_document("d2")).await {
        Err(PipelineError::StepError { step_name, source }) => {
            assert_eq!(step_name, "broken");
            assert!(matches!(*source, PipelineError::ProcessError { .. }));
        }
        other => panic!("Expected StepError, got {:?}", other),
    }
    assert_eq!(*log.lock().unwrap(), vec!["first", "broken"]);
}

#[tokio::test]
async fn test_empty_executor_is_identity() {
    let executor = PipelineExecutor::new(Vec::new());
    assert!(executor.is_empty());
    let doc = create_test_document("d3");
    assert_eq!(executor.run_single_async(doc.clone()).await.unwrap(), doc);
}

#[tokio::test]
async fn test_built_in_steps_from_config() {
    let configs = vec![
        StepConfig::CopyField(CopyFieldParams {
            from: "title".to_string(),
            to: "meta.headline".to_string(),
        }),
        StepConfig::RemoveFields(RemoveFieldsParams {
            fields: vec!["tracking".to_string()],
        }),
        StepConfig::SetStaticField(SetStaticFieldParams {
            field: "title".to_string(),
            value: json!("ignored"),
            overwrite: false,
        }),
    ];
    let executor = PipelineExecutor::new(build_steps_from_config(&configs).unwrap());
    let doc = executor
        .run_single_async(create_test_document("d4"))
        .await
        .unwrap();
    assert_eq!(
        serde_json::Value::Object(doc.contents),
        json!({"title": "Hello", "meta": {"headline": "Hello"}})
    );
}
