// src/bin/node.rs

//! # Node Binary
//!
//! Runs the coordinating side of a DocRelay deployment in one process:
//!
//! 1.  **Store**: the in-memory document store, restored from its snapshot file
//!     when one is configured, flushed periodically and once more on shutdown.
//!     Attachments of documents that left the store are pruned on the same timer.
//!
//! 2.  **Protocol server**: the HTTP/JSON coordination protocol that stage workers
//!     and producers talk to.
//!
//! 3.  **Rollover**: moves archivable documents into the bounded archive on a
//!     timer, and immediately after a commit makes a document archivable.
//!
//! 4.  **Supervisor**: launches one worker process per scheduled stage and keeps
//!     the set in line with the deployed pipeline (disabled by `--no-supervisor`).

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use DocRelay::config::node::Args;
use DocRelay::config::{load_node_config, load_pipeline_definition, NodeConfig};
use DocRelay::error::{PipelineError, Result};
use DocRelay::server::{run_server, AppState};
use DocRelay::store::{ArtifactRepository, AttachmentRepository, DocumentStore, MemoryStore};
use DocRelay::supervisor::{ProcessLauncher, Supervisor};
use DocRelay::utils::{init_tracing, shutdown_signal};

/// URL workers use to reach this node. Wildcard binds are reached over loopback.
fn local_server_url(addr: SocketAddr) -> String {
    if addr.ip().is_unspecified() {
        format!("http://127.0.0.1:{}", addr.port())
    } else {
        format!("http://{}", addr)
    }
}

async fn rollover_loop(
    store: Arc<dyn DocumentStore>,
    wake: Arc<Notify>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            _ = wake.notified() => {}
        }
        match store.rollover().await {
            Ok(report) if report.archived > 0 || report.evicted > 0 => info!(
                archived = report.archived,
                evicted = report.evicted,
                "Rollover complete"
            ),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Rollover failed"),
        }
    }
}

async fn flush_loop(
    store: Arc<dyn DocumentStore>,
    attachments: AttachmentRepository,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = store.persist().await {
            warn!(error = %e, "Snapshot flush failed");
        }
        if let Err(e) = attachments.prune(store.as_ref()).await {
            warn!(error = %e, "Attachment pruning failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(args.log_dir.as_deref(), args.json_logs, "info");

    let mut config = match &args.config {
        Some(path) => {
            info!("Loading node configuration from: {}", path.display());
            load_node_config(path)?
        }
        None => NodeConfig::default(),
    };
    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    config.validate()?;

    let initial_pipeline = match &args.pipeline {
        Some(path) => {
            info!("Loading pipeline definition from: {}", path.display());
            Some(load_pipeline_definition(path)?)
        }
        None => None,
    };

    if args.validate_config {
        info!("Configuration is valid.");
        if let Some(p) = &initial_pipeline {
            info!(
                pipeline = %p.name,
                stages = p.stages().count(),
                "Pipeline definition is valid."
            );
        }
        return Ok(());
    }

    let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::open(&config.store).await?);
    if let Some(pipeline) = initial_pipeline {
        let version = store.save_pipeline(pipeline).await?;
        info!(version, "Deployed pipeline from command line");
    }

    let artifacts = ArtifactRepository::open(&config.server.artifact_dir).await?;
    let attachments = AttachmentRepository::open(&config.server.attachment_dir).await?;
    let state = Arc::new(AppState::new(
        store.clone(),
        artifacts.clone(),
        attachments.clone(),
    ));

    let listener = TcpListener::bind(&config.server.bind).await.map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to bind '{}': {}",
            config.server.bind, e
        ))
    })?;
    let local_addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();

    let server_task = tokio::spawn(run_server(listener, state.clone(), shutdown.clone()));
    let rollover_task = tokio::spawn(rollover_loop(
        store.clone(),
        state.rollover.clone(),
        Duration::from_secs(config.store.rollover_interval_secs),
        shutdown.clone(),
    ));
    let flush_task = tokio::spawn(flush_loop(
        store.clone(),
        attachments,
        Duration::from_secs(config.store.flush_interval_secs),
        shutdown.clone(),
    ));

    let supervisor_task = if args.no_supervisor {
        info!("Supervisor disabled, stage workers must be started externally");
        None
    } else {
        let server_url = config
            .supervisor
            .server_url
            .clone()
            .unwrap_or_else(|| local_server_url(local_addr));
        let launcher = Arc::new(ProcessLauncher::new(&config.supervisor, server_url, artifacts));
        let supervisor = Supervisor::new(store.clone(), launcher, config.supervisor.clone());
        Some(tokio::spawn(
            supervisor.run(state.redeploy.clone(), shutdown.clone()),
        ))
    };

    shutdown_signal().await;
    info!("Shutting down node...");
    shutdown.cancel();

    if let Some(task) = supervisor_task {
        if let Err(e) = task.await {
            error!("Supervisor task panicked: {}", e);
        }
    }
    for (name, task) in [("rollover", rollover_task), ("flush", flush_task)] {
        if let Err(e) = task.await {
            error!("{} task panicked: {}", name, e);
        }
    }
    match server_task.await {
        Ok(Err(e)) => error!("Protocol server error: {}", e),
        Err(e) => error!("Protocol server task panicked: {}", e),
        Ok(Ok(())) => {}
    }

    store.persist().await?;
    info!("Node stopped.");
    Ok(())
}
