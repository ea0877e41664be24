// tests/worker_tests.rs

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use DocRelay::client::RemotePipeline;
use DocRelay::config::StoreConfig;
use DocRelay::data_model::{Document, OutcomeKind, ProcessingOutcome};
use DocRelay::error::{PipelineError, Result};
use DocRelay::executor::{PipelineExecutor, ProcessingStep};
use DocRelay::pipeline::{Pipeline, Stage, StageGroup, StageSettings};
use DocRelay::query::Query;
use DocRelay::server::{run_server, AppState};
use DocRelay::store::{ArtifactRepository, AttachmentRepository, DocumentStore, MemoryStore};
use DocRelay::worker_logic::{execute_processing_pipeline, CycleOutcome, StageWorker};

struct FailingStep;

#[async_trait]
impl ProcessingStep for FailingStep {
    fn name(&self) -> &'static str {
        "FailingStep"
    }

    async fn process(&self, _document: Document) -> Result<Document> {
        Err(PipelineError::ProcessError {
            step_name: "FailingStep".to_string(),
            message: "boom".to_string(),
        })
    }
}

struct FilteringStep;

#[async_trait]
impl ProcessingStep for FilteringStep {
    fn name(&self) -> &'static str {
        "FilteringStep"
    }

    async fn process(&self, doc: Document) -> Result<Document> {
        Err(PipelineError::DocumentFiltered {
            document: Box::new(doc),
            reason: "Blocked by test filter".to_string(),
        })
    }
}

struct TaggingStep;

#[async_trait]
impl ProcessingStep for TaggingStep {
    fn name(&self) -> &'static str {
        "TaggingStep"
    }

    async fn process(&self, mut doc: Document) -> Result<Document> {
        doc.contents.insert("tagged".to_string(), json!(true));
        Ok(doc)
    }
}

struct SlowStep(Duration);

#[async_trait]
impl ProcessingStep for SlowStep {
    fn name(&self) -> &'static str {
        "SlowStep"
    }

    async fn process(&self, mut doc: Document) -> Result<Document> {
        tokio::time::sleep(self.0).await;
        doc.contents.insert("by".to_string(), json!("slow"));
        Ok(doc)
    }
}

fn doc(id: &str) -> Document {
    Document::from_value(json!({"title": "hello"})).with_id(id)
}

#[tokio::test]
async fn test_success_path() {
    let steps: Vec<Box<dyn ProcessingStep>> = vec![Box::new(TaggingStep)];
    let executor = PipelineExecutor::new(steps);
    match execute_processing_pipeline(&executor, doc("doc-1")).await {
        ProcessingOutcome::Success(d) => {
            assert_eq!(d.id, "doc-1");
            assert_eq!(d.contents.get("tagged"), Some(&json!(true)));
        }
        _ => panic!("Expected success outcome"),
    }
}

#[tokio::test]
async fn test_filtered_path() {
    let steps: Vec<Box<dyn ProcessingStep>> = vec![Box::new(TaggingStep), Box::new(FilteringStep)];
    let executor = PipelineExecutor::new(steps);
    match execute_processing_pipeline(&executor, doc("doc-2")).await {
        ProcessingOutcome::Filtered { document, reason } => {
            assert_eq!(document.id, "doc-2");
            // Changes made before the filter travel with the document.
            assert_eq!(document.contents.get("tagged"), Some(&json!(true)));
            assert_eq!(reason, "Blocked by test filter");
        }
        _ => panic!("Expected filtered outcome"),
    }
}

#[tokio::test]
async fn test_error_path() {
    let steps: Vec<Box<dyn ProcessingStep>> = vec![Box::new(FailingStep), Box::new(TaggingStep)];
    let executor = PipelineExecutor::new(steps);
    match execute_processing_pipeline(&executor, doc("doc-3")).await {
        ProcessingOutcome::Error { id, error_message } => {
            assert_eq!(id, "doc-3");
            assert!(error_message.contains("boom"), "{}", error_message);
        }
        _ => panic!("Expected error outcome"),
    }
}

// --- Against a live node ---

type Node = (RemotePipeline, Arc<AppState>, CancellationToken, tempfile::TempDir);

async fn start_node() -> Node {
    start_node_with(StoreConfig::default()).await
}

async fn start_node_with(config: StoreConfig) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new(&config));
    let artifacts = ArtifactRepository::open(dir.path().join("artifacts"))
        .await
        .unwrap();
    let attachments = AttachmentRepository::open(dir.path().join("attachments"))
        .await
        .unwrap();
    let state = Arc::new(AppState::new(store, artifacts, attachments));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(run_server(listener, state.clone(), shutdown.clone()));
    let client = RemotePipeline::new(format!("http://{}", addr))
        .unwrap()
        .with_retry(2, Duration::from_millis(10), Duration::from_millis(50));
    (client, state, shutdown, dir)
}

fn two_stage_pipeline() -> Pipeline {
    Pipeline::new(
        "enrichment",
        vec![StageGroup::new(
            "main",
            vec![
                Stage::new("enrich")
                    .with_property("holdInterval", 10)
                    .with_property(
                        "steps",
                        json!([{"type": "SetStaticField", "field": "lang", "value": "en"}]),
                    ),
                Stage::new("screen")
                    .with_property("holdInterval", 10)
                    .with_property("queryOptions", json!(["touched(enrich,true)"]))
                    .with_property(
                        "steps",
                        json!([{"type": "Discard", "field": "spam", "reason": "spam"}]),
                    ),
            ],
        )],
    )
}

async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition not reached in time");
}

#[tokio::test]
async fn test_run_once_commits_and_idles() {
    let (client, state, shutdown, _dir) = start_node().await;
    client.deploy_pipeline(&two_stage_pipeline()).await.unwrap();
    let id = client
        .insert(&Document::from_value(json!({"title": "t"})))
        .await
        .unwrap();

    let worker = StageWorker::connect(client.clone(), "enrich").await.unwrap();
    assert_eq!(worker.settings().hold_interval, Duration::from_millis(10));
    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Committed);
    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);

    let stored = state.store.get_document_by_id(&id, false).await.unwrap().unwrap();
    assert_eq!(stored.contents.get("lang"), Some(&json!("en")));
    assert!(stored.is_touched_by("enrich"));
    shutdown.cancel();
}

#[tokio::test]
async fn test_failing_steps_release_the_document() {
    let (client, state, shutdown, _dir) = start_node().await;
    let id = client
        .insert(&Document::from_value(json!({"title": "t"})))
        .await
        .unwrap();

    let settings = StageSettings::from_properties(&serde_json::Map::new()).unwrap();
    let steps: Vec<Box<dyn ProcessingStep>> = vec![Box::new(FailingStep)];
    let worker = StageWorker::new("flaky", client.clone(), settings, PipelineExecutor::new(steps));
    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Released);

    let stored = state.store.get_document_by_id(&id, false).await.unwrap().unwrap();
    assert!(!stored.is_fetched_by("flaky"));
    assert!(!stored.is_touched_by("flaky"));
    shutdown.cancel();
}

#[tokio::test]
async fn test_worker_outlived_by_its_lease_reports_lost() {
    let (client, state, shutdown, _dir) = start_node_with(StoreConfig {
        lease_timeout_ms: Some(50),
        ..StoreConfig::default()
    })
    .await;
    let id = client
        .insert(&Document::from_value(json!({"title": "t"})))
        .await
        .unwrap();

    let settings = StageSettings::from_properties(&serde_json::Map::new()).unwrap();
    let steps: Vec<Box<dyn ProcessingStep>> = vec![Box::new(SlowStep(Duration::from_millis(200)))];
    let worker = StageWorker::new("S", client.clone(), settings, PipelineExecutor::new(steps));
    let slow = tokio::spawn(async move { worker.run_once().await });

    // A second holder takes over once the lease lapses and finishes first.
    let store = state.store.clone();
    let mut rival = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if let Some(doc) = store.claim_and_tag(&Query::new(), "S").await.unwrap() {
            rival = Some(doc);
            break;
        }
    }
    let mut rival = rival.expect("Expected the lease to lapse");
    rival.contents.insert("by".to_string(), json!("rival"));
    store.mark_processed(rival, "S").await.unwrap();

    assert_eq!(slow.await.unwrap().unwrap(), CycleOutcome::Lost);
    let stored = store.get_document_by_id(&id, false).await.unwrap().unwrap();
    assert_eq!(stored.contents["by"], json!("rival"));
    shutdown.cancel();
}

#[tokio::test]
async fn test_connect_to_unknown_stage_fails() {
    let (client, _state, shutdown, _dir) = start_node().await;
    client.deploy_pipeline(&two_stage_pipeline()).await.unwrap();
    match StageWorker::connect(client, "missing").await {
        Err(PipelineError::DocumentNotFound(_)) => {}
        Err(e) => panic!("Expected DocumentNotFound, got {:?}", e),
        Ok(_) => panic!("Expected DocumentNotFound, got a worker"),
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_two_stage_workers_process_the_stream() {
    let (client, state, shutdown, _dir) = start_node().await;
    client.deploy_pipeline(&two_stage_pipeline()).await.unwrap();

    let good = client
        .insert(&Document::from_value(json!({"title": "good"})))
        .await
        .unwrap();
    let spam = client
        .insert(&Document::from_value(json!({"title": "bad", "spam": true})))
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let mut handles = Vec::new();
    for stage in ["enrich", "screen"] {
        let worker = StageWorker::connect(client.clone(), stage).await.unwrap();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move { worker.run(cancel).await }));
    }

    let store = state.store.clone();
    wait_for(|| {
        let store = store.clone();
        let good = good.clone();
        let spam = spam.clone();
        async move {
            let screened = store
                .get_document_by_id(&good, false)
                .await
                .unwrap()
                .is_some_and(|d| d.is_touched_by("screen"));
            let spam_gone = store.get_document_by_id(&spam, false).await.unwrap().is_none();
            screened && spam_gone
        }
    })
    .await;

    cancel.cancel();
    let mut committed = 0;
    let mut discarded = 0;
    for handle in handles {
        let summary = handle.await.unwrap().unwrap();
        committed += summary.committed;
        discarded += summary.discarded;
    }
    assert_eq!(committed, 3);
    assert_eq!(discarded, 1);

    let archived = state.store.get_document_by_id(&spam, true).await.unwrap().unwrap();
    let outcome = archived.metadata.outcome.unwrap();
    assert_eq!(outcome.kind, OutcomeKind::Discarded);
    assert_eq!(outcome.stage, "screen");

    // Both stages touched the good document, so rollover archives it.
    assert_eq!(state.store.rollover().await.unwrap().archived, 1);
    assert_eq!(
        state.store.count_documents(&Query::new()).await.unwrap(),
        0
    );
    shutdown.cancel();
}
