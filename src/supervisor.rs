//! Node master: keeps one worker process per scheduled stage.
//!
//! The supervisor loads the pipeline from the store, diffs it against what is
//! currently deployed, and starts, stops or restarts per-stage runners. Each
//! runner owns one worker process at a time, restarting it after a crash with
//! exponential backoff until the stage's restart budget is spent.

use crate::config::SupervisorConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::{Pipeline, PipelineDiff, Stage, StageMode};
use crate::store::{ArtifactRepository, DocumentStore};
use crate::utils::backoff_delay;
use crate::utils::prometheus_metrics::*;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SupervisorState {
    Idle,
    Loading,
    Reconciling,
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunnerStatus {
    Starting,
    Running { crashes: u32 },
    Restarting { crashes: u32, delay_ms: u64 },
    /// Worker exited on its own with success.
    Exited,
    Stopped,
    Failed { crashes: u32 },
}

/// Current status of every stage that has (or had) a runner.
pub type StatusBoard = Arc<RwLock<BTreeMap<String, RunnerStatus>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Clean,
    Crashed(Option<i32>),
}

/// What a runner needs to launch a stage's worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSpec {
    pub stage: Stage,
    pub group: String,
    pub max_restarts: u32,
}

impl StageSpec {
    pub fn is_debug(&self) -> bool {
        self.stage.mode == StageMode::Debug
    }
}

#[async_trait]
pub trait WorkerHandle: Send {
    /// Resolves when the worker exits.
    async fn wait(&mut self) -> Result<WorkerExit>;

    /// Asks the worker to finish its current document and exit.
    async fn request_stop(&mut self);

    async fn kill(&mut self) -> Result<()>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, spec: &StageSpec) -> Result<Box<dyn WorkerHandle>>;
}

// --- Process-backed workers ---

/// Launches each stage as a child process of the node.
///
/// A stage with an artifact runs that artifact (materialized under
/// `namespace_dir/<stage>/`); otherwise `worker_program` is used.
pub struct ProcessLauncher {
    server_url: String,
    worker_program: PathBuf,
    namespace_dir: PathBuf,
    artifacts: ArtifactRepository,
}

impl ProcessLauncher {
    pub fn new(config: &SupervisorConfig, server_url: String, artifacts: ArtifactRepository) -> Self {
        ProcessLauncher {
            server_url,
            worker_program: config.worker_program.clone(),
            namespace_dir: config.namespace_dir.clone(),
            artifacts,
        }
    }

    async fn materialize(&self, workdir: &std::path::Path, artifact: &str) -> Result<PathBuf> {
        let path = workdir.join(artifact);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(path);
        }
        let bytes = self.artifacts.get(artifact).await?;
        tokio::fs::write(&path, bytes).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        }
        info!(artifact = %artifact, path = %path.display(), "Materialized stage artifact");
        Ok(path)
    }
}

fn forward_output<R>(stage: String, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(stage = %stage, stream, "{}", line);
        }
    });
}

struct ProcessHandle {
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    async fn wait(&mut self) -> Result<WorkerExit> {
        let status = self.child.wait().await?;
        if status.success() {
            Ok(WorkerExit::Clean)
        } else {
            Ok(WorkerExit::Crashed(status.code()))
        }
    }

    async fn request_stop(&mut self) {
        // The worker treats EOF on stdin as its stop signal.
        self.stdin.take();
    }

    async fn kill(&mut self) -> Result<()> {
        self.child.kill().await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, spec: &StageSpec) -> Result<Box<dyn WorkerHandle>> {
        let name = &spec.stage.name;
        let workdir = self.namespace_dir.join(name);
        tokio::fs::create_dir_all(&workdir).await?;

        let program = match &spec.stage.artifact_ref {
            Some(artifact) => self.materialize(&workdir, artifact).await?,
            None => self.worker_program.clone(),
        };

        let mut cmd = Command::new(&program);
        cmd.arg("--server-url")
            .arg(&self.server_url)
            .arg("--stage")
            .arg(name)
            .arg("--stop-on-stdin-eof");
        if spec.is_debug() {
            cmd.arg("--debug");
        }
        cmd.current_dir(&workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| PipelineError::ProcessError {
            step_name: name.clone(),
            message: format!("failed to spawn '{}': {}", program.display(), e),
        })?;
        if let Some(out) = child.stdout.take() {
            forward_output(name.clone(), "stdout", out);
        }
        if let Some(err) = child.stderr.take() {
            forward_output(name.clone(), "stderr", err);
        }
        let stdin = child.stdin.take();
        debug!(stage = %name, pid = ?child.id(), "Spawned worker process");
        Ok(Box::new(ProcessHandle { child, stdin }))
    }
}

// --- Runners ---

#[derive(Debug, Clone, Copy)]
struct RestartPolicy {
    backoff_base: Duration,
    backoff_max: Duration,
    stop_timeout: Duration,
}

async fn set_status(board: &StatusBoard, stage: &str, status: RunnerStatus) {
    board.write().await.insert(stage.to_string(), status);
}

/// Stops a running worker: graceful request first, then a kill after `stop_timeout`.
async fn stop_worker(handle: &mut Box<dyn WorkerHandle>, stage: &str, stop_timeout: Duration) {
    handle.request_stop().await;
    match timeout(stop_timeout, handle.wait()).await {
        Ok(Ok(exit)) => debug!(stage = %stage, ?exit, "Worker stopped"),
        Ok(Err(e)) => warn!(stage = %stage, error = %e, "Failed to wait for worker"),
        Err(_) => {
            warn!(stage = %stage, "Worker ignored stop request, killing it");
            if let Err(e) = handle.kill().await {
                error!(stage = %stage, error = %e, "Failed to kill worker");
            }
        }
    }
}

/// Supervises one stage until `stop` fires, the worker exits cleanly, or the
/// restart budget is exhausted.
async fn run_stage(
    spec: StageSpec,
    launcher: Arc<dyn WorkerLauncher>,
    policy: RestartPolicy,
    board: StatusBoard,
    stop: CancellationToken,
) {
    let name = spec.stage.name.clone();
    // DEBUG stages are never restarted.
    let budget = if spec.is_debug() { 0 } else { spec.max_restarts };
    let mut crashes: u32 = 0;

    while !stop.is_cancelled() {
        set_status(&board, &name, RunnerStatus::Starting).await;
        SUPERVISOR_WORKER_STARTS_TOTAL.inc();

        let exit = match launcher.launch(&spec).await {
            Ok(mut handle) => {
                info!(stage = %name, crashes, "Worker launched");
                set_status(&board, &name, RunnerStatus::Running { crashes }).await;
                tokio::select! {
                    exit = handle.wait() => exit,
                    _ = stop.cancelled() => {
                        stop_worker(&mut handle, &name, policy.stop_timeout).await;
                        break;
                    }
                }
            }
            Err(e) => Err(e),
        };

        match exit {
            Ok(WorkerExit::Clean) => {
                info!(stage = %name, "Worker exited cleanly, not restarting");
                set_status(&board, &name, RunnerStatus::Exited).await;
                return;
            }
            Ok(WorkerExit::Crashed(code)) => {
                warn!(stage = %name, ?code, "Worker crashed");
            }
            Err(e) => {
                warn!(stage = %name, error = %e, "Worker failed to launch");
            }
        }

        crashes += 1;
        SUPERVISOR_WORKER_CRASHES_TOTAL.inc();
        if crashes > budget {
            let err = PipelineError::SupervisorRestartExhausted {
                stage: name.clone(),
                attempts: crashes,
            };
            error!(stage = %name, error = %err, "Giving up on stage");
            set_status(&board, &name, RunnerStatus::Failed { crashes }).await;
            return;
        }

        let delay = backoff_delay(crashes, policy.backoff_base, policy.backoff_max);
        set_status(
            &board,
            &name,
            RunnerStatus::Restarting {
                crashes,
                delay_ms: delay.as_millis() as u64,
            },
        )
        .await;
        tokio::select! {
            _ = sleep(delay) => {}
            _ = stop.cancelled() => break,
        }
    }
    set_status(&board, &name, RunnerStatus::Stopped).await;
}

struct Runner {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    store: Arc<dyn DocumentStore>,
    launcher: Arc<dyn WorkerLauncher>,
    config: SupervisorConfig,
    deployed: Pipeline,
    runners: HashMap<String, Runner>,
    board: StatusBoard,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        launcher: Arc<dyn WorkerLauncher>,
        config: SupervisorConfig,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Supervisor {
            store,
            launcher,
            config,
            deployed: Pipeline::default(),
            runners: HashMap::new(),
            board: Arc::new(RwLock::new(BTreeMap::new())),
            state,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    pub fn status_board(&self) -> StatusBoard {
        self.board.clone()
    }

    pub fn deployed(&self) -> &Pipeline {
        &self.deployed
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(?state, "Supervisor state");
        self.state.send_replace(state);
    }

    fn policy(&self) -> RestartPolicy {
        RestartPolicy {
            backoff_base: Duration::from_millis(self.config.backoff_base_ms),
            backoff_max: Duration::from_millis(self.config.backoff_max_ms),
            stop_timeout: Duration::from_secs(self.config.stop_timeout_secs),
        }
    }

    fn spec_for(&self, pipeline: &Pipeline, name: &str) -> Option<StageSpec> {
        let group = pipeline.group_of(name)?;
        let stage = pipeline.stage(name)?;
        Some(StageSpec {
            stage: stage.clone(),
            group: group.name.clone(),
            max_restarts: group.max_restarts.unwrap_or(self.config.max_restarts),
        })
    }

    fn start_runner(&mut self, spec: StageSpec) {
        let name = spec.stage.name.clone();
        let stop = CancellationToken::new();
        let span = info_span!("stage_runner", stage = %name, group = %spec.group);
        let task = tokio::spawn(
            run_stage(
                spec,
                self.launcher.clone(),
                self.policy(),
                self.board.clone(),
                stop.clone(),
            )
            .instrument(span),
        );
        self.runners.insert(name, Runner { stop, task });
    }

    async fn stop_runner(&mut self, name: &str) {
        if let Some(runner) = self.runners.remove(name) {
            runner.stop.cancel();
            if let Err(e) = runner.task.await {
                error!(stage = %name, error = %e, "Stage runner panicked");
            }
        }
    }

    /// Loads the stored pipeline and brings the runners in line with it.
    pub async fn reconcile(&mut self) -> Result<PipelineDiff> {
        self.set_state(SupervisorState::Loading);
        let next = match self.store.load_pipeline().await {
            Ok(p) => p.unwrap_or_default(),
            Err(e) => {
                self.set_state(SupervisorState::Running);
                return Err(e);
            }
        };

        self.set_state(SupervisorState::Reconciling);
        let diff = self.deployed.diff(&next);
        if !diff.is_empty() {
            info!(
                pipeline = %next.name,
                version = next.version,
                added = ?diff.added,
                removed = ?diff.removed,
                changed = ?diff.changed,
                "Reconciling pipeline"
            );
        }

        for name in diff.removed.iter().chain(diff.changed.iter()) {
            self.stop_runner(name).await;
            if diff.removed.contains(name) {
                self.board.write().await.remove(name);
            }
        }
        for name in diff.added.iter().chain(diff.changed.iter()) {
            match self.spec_for(&next, name) {
                Some(spec) => self.start_runner(spec),
                None => warn!(stage = %name, "Stage vanished during reconcile"),
            }
        }

        self.deployed = next;
        SUPERVISOR_RECONCILES_TOTAL.inc();
        SUPERVISOR_RUNNING_STAGES.set(self.runners.len() as f64);
        self.set_state(SupervisorState::Running);
        Ok(diff)
    }

    /// Runs until `shutdown` fires, reconciling on every poll tick and redeploy notification.
    pub async fn run(mut self, redeploy: Arc<Notify>, shutdown: CancellationToken) {
        let mut poll = tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "Supervisor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = redeploy.notified() => info!("Redeploy requested"),
                _ = poll.tick() => {}
            }
            if let Err(e) = self.reconcile().await {
                error!(error = %e, "Reconcile failed, will retry on next poll");
            }
        }
        self.shutdown().await;
    }

    /// Stops every runner concurrently, each escalating to a kill after `stop_timeout`.
    pub async fn shutdown(&mut self) {
        info!(stages = self.runners.len(), "Stopping all stage workers");
        let (names, tasks): (Vec<String>, Vec<JoinHandle<()>>) = self
            .runners
            .drain()
            .map(|(name, runner)| {
                runner.stop.cancel();
                (name, runner.task)
            })
            .unzip();
        for (name, joined) in names.iter().zip(join_all(tasks).await) {
            if let Err(e) = joined {
                error!(stage = %name, error = %e, "Stage runner panicked");
            }
        }
        SUPERVISOR_RUNNING_STAGES.set(0.0);
        self.set_state(SupervisorState::Stopped);
    }
}
