// src/bin/worker.rs

//! # Worker Binary
//!
//! Runs one pipeline stage against a node's coordination server. On startup it
//! fetches the stage's properties (subscription query, steps, intervals), then
//! loops: claim a matching document, run the steps, and commit, discard or
//! release it.
//!
//! The node's supervisor starts this binary with `--stop-on-stdin-eof` and
//! closes stdin to ask for a graceful stop. Ctrl-C and SIGTERM stop it as well.
//! In either case the document in hand is finished before exit.

use clap::Parser;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use DocRelay::client::RemotePipeline;
use DocRelay::config::worker::Args;
use DocRelay::error::Result;
use DocRelay::utils::{init_tracing, setup_prometheus_metrics, shutdown_signal};
use DocRelay::worker_logic::StageWorker;

/// Cancels `token` once stdin reaches EOF (or fails).
fn watch_stdin(token: CancellationToken) {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        info!("Stdin closed, stopping after the current document");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    let _log_guard = init_tracing(args.log_dir.as_deref(), args.json_logs, level);

    setup_prometheus_metrics(args.metrics_port).await?;

    info!(
        stage = %args.stage,
        server = %args.server_url,
        debug = args.debug,
        "Worker starting."
    );

    let client = RemotePipeline::new(&args.server_url)?;
    let worker = StageWorker::connect(client, &args.stage).await?;

    let cancel = CancellationToken::new();
    if args.stop_on_stdin_eof {
        watch_stdin(cancel.clone());
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    match worker.run(cancel).await {
        Ok(summary) => {
            info!(
                committed = summary.committed,
                discarded = summary.discarded,
                released = summary.released,
                lost = summary.lost,
                "Worker finished."
            );
            Ok(())
        }
        Err(e) => {
            error!(stage = %args.stage, "Worker failed: {}", e);
            Err(e)
        }
    }
}
