// tests/supervisor_tests.rs

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use DocRelay::config::{StoreConfig, SupervisorConfig};
use DocRelay::error::{PipelineError, Result};
use DocRelay::pipeline::{Pipeline, Stage, StageGroup, StageMode};
use DocRelay::store::{DocumentStore, MemoryStore};
use DocRelay::supervisor::{
    RunnerStatus, StageSpec, Supervisor, SupervisorState, WorkerExit, WorkerHandle, WorkerLauncher,
};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Behavior {
    RunUntilStopped,
    Crash,
    ExitClean,
    IgnoreStop,
    FailToLaunch,
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Launched(String),
    StopRequested(String),
    Killed(String),
}

#[derive(Default)]
struct FakeLauncher {
    behaviors: Mutex<HashMap<String, Behavior>>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl FakeLauncher {
    fn with(behaviors: &[(&str, Behavior)]) -> Arc<Self> {
        let launcher = FakeLauncher::default();
        {
            let mut map = launcher.behaviors.lock().unwrap();
            for (stage, b) in behaviors {
                map.insert(stage.to_string(), *b);
            }
        }
        Arc::new(launcher)
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn count(&self, wanted: &Event) -> usize {
        self.events().iter().filter(|e| *e == wanted).count()
    }
}

struct FakeHandle {
    stage: String,
    behavior: Behavior,
    stop: Arc<Notify>,
    events: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    async fn wait(&mut self) -> Result<WorkerExit> {
        match self.behavior {
            Behavior::Crash => {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(WorkerExit::Crashed(Some(101)))
            }
            Behavior::ExitClean => Ok(WorkerExit::Clean),
            Behavior::RunUntilStopped => {
                self.stop.notified().await;
                Ok(WorkerExit::Clean)
            }
            Behavior::IgnoreStop | Behavior::FailToLaunch => {
                std::future::pending::<()>().await;
                Ok(WorkerExit::Clean)
            }
        }
    }

    async fn request_stop(&mut self) {
        self.events
            .lock()
            .unwrap()
            .push(Event::StopRequested(self.stage.clone()));
        self.stop.notify_one();
    }

    async fn kill(&mut self) -> Result<()> {
        self.events
            .lock()
            .unwrap()
            .push(Event::Killed(self.stage.clone()));
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, spec: &StageSpec) -> Result<Box<dyn WorkerHandle>> {
        let stage = spec.stage.name.clone();
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&stage)
            .copied()
            .unwrap_or(Behavior::RunUntilStopped);
        self.events
            .lock()
            .unwrap()
            .push(Event::Launched(stage.clone()));
        if behavior == Behavior::FailToLaunch {
            return Err(PipelineError::ProcessError {
                step_name: stage,
                message: "no such file".to_string(),
            });
        }
        Ok(Box::new(FakeHandle {
            stage,
            behavior,
            stop: Arc::new(Notify::new()),
            events: self.events.clone(),
        }))
    }
}

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        max_restarts: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        stop_timeout_secs: 1,
        poll_interval_secs: 3600,
        ..SupervisorConfig::default()
    }
}

fn pipeline(stages: Vec<Stage>) -> Pipeline {
    Pipeline::new("p", vec![StageGroup::new("g", stages)])
}

async fn store_with(p: Pipeline) -> Arc<dyn DocumentStore> {
    let store = MemoryStore::new(&StoreConfig::default());
    store.save_pipeline(p).await.unwrap();
    Arc::new(store)
}

async fn wait_for_status(supervisor: &Supervisor, stage: &str, wanted: RunnerStatus) {
    let board = supervisor.status_board();
    for _ in 0..250 {
        if board.read().await.get(stage) == Some(&wanted) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "Stage {} never reached {:?}, board: {:?}",
        stage,
        wanted,
        board.read().await
    );
}

#[tokio::test]
async fn test_reconcile_starts_scheduled_stages_only() {
    let store = store_with(pipeline(vec![
        Stage::new("A"),
        Stage::new("Dbg").with_mode(StageMode::Debug),
        Stage::new("Off").with_mode(StageMode::Inactive),
    ]))
    .await;
    let launcher = FakeLauncher::with(&[]);
    let mut supervisor = Supervisor::new(store, launcher.clone(), fast_config());
    assert_eq!(supervisor.state(), SupervisorState::Idle);

    let diff = supervisor.reconcile().await.unwrap();
    assert_eq!(diff.added.len(), 2);
    assert_eq!(supervisor.state(), SupervisorState::Running);

    wait_for_status(&supervisor, "A", RunnerStatus::Running { crashes: 0 }).await;
    wait_for_status(&supervisor, "Dbg", RunnerStatus::Running { crashes: 0 }).await;
    assert!(!supervisor.status_board().read().await.contains_key("Off"));

    supervisor.shutdown().await;
    assert_eq!(supervisor.state(), SupervisorState::Stopped);
    assert_eq!(launcher.count(&Event::StopRequested("A".into())), 1);
    assert_eq!(launcher.count(&Event::Killed("A".into())), 0);
}

#[tokio::test]
async fn test_redeploy_stops_removed_and_restarts_changed() {
    let store = store_with(pipeline(vec![Stage::new("A"), Stage::new("B")])).await;
    let launcher = FakeLauncher::with(&[]);
    let mut supervisor = Supervisor::new(store.clone(), launcher.clone(), fast_config());
    supervisor.reconcile().await.unwrap();
    wait_for_status(&supervisor, "B", RunnerStatus::Running { crashes: 0 }).await;

    store
        .save_pipeline(pipeline(vec![
            Stage::new("A").with_property("holdInterval", 50),
            Stage::new("C"),
        ]))
        .await
        .unwrap();
    let diff = supervisor.reconcile().await.unwrap();
    assert_eq!(diff.removed, vec!["B".to_string()]);
    assert_eq!(diff.changed, vec!["A".to_string()]);
    assert_eq!(diff.added, vec!["C".to_string()]);

    wait_for_status(&supervisor, "C", RunnerStatus::Running { crashes: 0 }).await;
    assert!(!supervisor.status_board().read().await.contains_key("B"));
    assert_eq!(launcher.count(&Event::StopRequested("B".into())), 1);
    assert_eq!(launcher.count(&Event::Launched("A".into())), 2);

    // Nothing changed: nothing restarts.
    assert!(supervisor.reconcile().await.unwrap().is_empty());
    assert_eq!(launcher.count(&Event::Launched("A".into())), 2);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_crashing_stage_exhausts_restarts() {
    let store = store_with(pipeline(vec![Stage::new("A")])).await;
    let launcher = FakeLauncher::with(&[("A", Behavior::Crash)]);
    let mut supervisor = Supervisor::new(store, launcher.clone(), fast_config());
    supervisor.reconcile().await.unwrap();

    wait_for_status(&supervisor, "A", RunnerStatus::Failed { crashes: 3 }).await;
    // One launch plus max_restarts retries.
    assert_eq!(launcher.count(&Event::Launched("A".into())), 3);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_launch_failures_count_as_crashes() {
    let store = store_with(pipeline(vec![Stage::new("A")])).await;
    let launcher = FakeLauncher::with(&[("A", Behavior::FailToLaunch)]);
    let mut supervisor = Supervisor::new(store, launcher.clone(), fast_config());
    supervisor.reconcile().await.unwrap();
    wait_for_status(&supervisor, "A", RunnerStatus::Failed { crashes: 3 }).await;
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_group_restart_budget_overrides_default() {
    let mut group = StageGroup::new("g", vec![Stage::new("A")]);
    group.max_restarts = Some(0);
    let store = store_with(Pipeline::new("p", vec![group])).await;
    let launcher = FakeLauncher::with(&[("A", Behavior::Crash)]);
    let mut supervisor = Supervisor::new(store, launcher.clone(), fast_config());
    supervisor.reconcile().await.unwrap();
    wait_for_status(&supervisor, "A", RunnerStatus::Failed { crashes: 1 }).await;
    assert_eq!(launcher.count(&Event::Launched("A".into())), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_debug_stage_is_not_restarted() {
    let store = store_with(pipeline(vec![
        Stage::new("Dbg").with_mode(StageMode::Debug)
    ]))
    .await;
    let launcher = FakeLauncher::with(&[("Dbg", Behavior::Crash)]);
    let mut supervisor = Supervisor::new(store, launcher.clone(), fast_config());
    supervisor.reconcile().await.unwrap();
    wait_for_status(&supervisor, "Dbg", RunnerStatus::Failed { crashes: 1 }).await;
    assert_eq!(launcher.count(&Event::Launched("Dbg".into())), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_clean_exit_is_not_restarted() {
    let store = store_with(pipeline(vec![Stage::new("A")])).await;
    let launcher = FakeLauncher::with(&[("A", Behavior::ExitClean)]);
    let mut supervisor = Supervisor::new(store, launcher.clone(), fast_config());
    supervisor.reconcile().await.unwrap();
    wait_for_status(&supervisor, "A", RunnerStatus::Exited).await;
    assert_eq!(launcher.count(&Event::Launched("A".into())), 1);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_unresponsive_worker_is_killed() {
    let store = store_with(pipeline(vec![Stage::new("A")])).await;
    let launcher = FakeLauncher::with(&[("A", Behavior::IgnoreStop)]);
    let config = SupervisorConfig {
        stop_timeout_secs: 0,
        ..fast_config()
    };
    let mut supervisor = Supervisor::new(store, launcher.clone(), config);
    supervisor.reconcile().await.unwrap();
    wait_for_status(&supervisor, "A", RunnerStatus::Running { crashes: 0 }).await;

    supervisor.shutdown().await;
    assert_eq!(
        launcher.events(),
        vec![
            Event::Launched("A".into()),
            Event::StopRequested("A".into()),
            Event::Killed("A".into()),
        ]
    );
}

#[tokio::test]
async fn test_run_reacts_to_redeploy_and_shutdown() {
    let store = store_with(pipeline(vec![Stage::new("A")])).await;
    let launcher = FakeLauncher::with(&[]);
    let supervisor = Supervisor::new(store.clone(), launcher.clone(), fast_config());
    let board = supervisor.status_board();
    let mut state = supervisor.subscribe();

    let redeploy = Arc::new(Notify::new());
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(supervisor.run(redeploy.clone(), shutdown.clone()));

    for _ in 0..250 {
        if board.read().await.contains_key("A") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    store
        .save_pipeline(pipeline(vec![Stage::new("A"), Stage::new("B")]))
        .await
        .unwrap();
    redeploy.notify_one();
    for _ in 0..250 {
        if launcher.count(&Event::Launched("B".into())) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(launcher.count(&Event::Launched("B".into())), 1);

    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(*state.borrow_and_update(), SupervisorState::Stopped);
    assert_eq!(launcher.count(&Event::StopRequested("A".into())), 1);
    assert_eq!(launcher.count(&Event::StopRequested("B".into())), 1);
}
