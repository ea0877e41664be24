// src/bin/producer.rs

//! # Producer Binary
//!
//! Feeds documents into a running node:
//!
//! 1.  Optionally uploads an artifact (a stage executable) and prints its id.
//! 2.  Optionally deploys a pipeline definition.
//! 3.  Reads a JSON Lines file and inserts one document per line. A line may be
//!     a full document (`{"id": .., "action": .., "contents": {..}}`) or a bare
//!     contents object, which becomes an ADD document with a generated id.
//!
//! Progress is shown with `indicatif`; Prometheus metrics are exposed when
//! `--metrics-port` is given.

use clap::Parser;
use indicatif::{HumanDuration, ProgressBar, ProgressStyle};
use serde_json::Value;
use std::path::Path;
use std::time::Instant;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use DocRelay::client::RemotePipeline;
use DocRelay::config::load_pipeline_definition;
use DocRelay::config::producer::Args;
use DocRelay::data_model::Document;
use DocRelay::error::{PipelineError, Result};
use DocRelay::utils::prometheus_metrics::*;
use DocRelay::utils::{init_tracing, setup_prometheus_metrics};

fn create_progress_bar(total_items: u64, message: &str, template: &str) -> ProgressBar {
    let pb = if total_items == 0 {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::new(total_items)
    };
    pb.set_message(message.to_string());
    pb.set_style(
        ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    pb
}

/// Parses one input line into a document.
fn parse_line(line: &str) -> Result<Document> {
    let value: Value = serde_json::from_str(line)?;
    let is_full_document = value
        .as_object()
        .is_some_and(|obj| obj.contains_key("contents"));
    if is_full_document {
        Ok(serde_json::from_value(value)?)
    } else if value.is_object() {
        Ok(Document::from_value(value))
    } else {
        Err(PipelineError::ConfigError(
            "Input line is not a JSON object".to_string(),
        ))
    }
}

async fn count_lines(path: &Path) -> Result<u64> {
    let file = File::open(path).await?;
    let mut lines = BufReader::new(file).lines();
    let mut n = 0;
    while let Some(line) = lines.next_line().await? {
        if !line.trim().is_empty() {
            n += 1;
        }
    }
    Ok(n)
}

async fn insert_documents(client: &RemotePipeline, path: &Path, pb: &ProgressBar) -> Result<(u64, u64)> {
    let file = File::open(path).await.map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to open input file '{}': {}",
            path.display(),
            e
        ))
    })?;
    let mut lines = BufReader::new(file).lines();
    let (mut inserted, mut errors) = (0u64, 0u64);
    let mut line_no = 0u64;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let doc = match parse_line(&line) {
            Ok(doc) => doc,
            Err(e) => {
                warn!(line = line_no, "Skipping unparsable line: {}", e);
                errors += 1;
                PRODUCER_INSERT_ERRORS_TOTAL.inc();
                pb.inc(1);
                continue;
            }
        };
        match client.insert(&doc).await {
            Ok(_) => {
                inserted += 1;
                PRODUCER_DOCUMENTS_INSERTED_TOTAL.inc();
            }
            Err(e @ PipelineError::DuplicateId(_)) => {
                warn!(line = line_no, "{}", e);
                errors += 1;
                PRODUCER_INSERT_ERRORS_TOTAL.inc();
            }
            Err(e) if e.is_retryable() => {
                error!("Node unreachable after retries: {}", e);
                return Err(e);
            }
            Err(e) => {
                warn!(line = line_no, "Insert rejected: {}", e);
                errors += 1;
                PRODUCER_INSERT_ERRORS_TOTAL.inc();
            }
        }
        pb.inc(1);
    }
    Ok((inserted, errors))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _log_guard = init_tracing(None, false, "info");
    setup_prometheus_metrics(args.metrics_port).await?;

    let client = RemotePipeline::new(&args.server_url)?;

    if let Some(path) = &args.artifact {
        let bytes = tokio::fs::read(path).await?;
        let id = client.upload_artifact(bytes).await?;
        info!("Uploaded artifact '{}' as {}", path.display(), id);
        println!("{}", id);
    }

    if let Some(path) = &args.pipeline {
        let pipeline = load_pipeline_definition(path)?;
        let version = client.deploy_pipeline(&pipeline).await?;
        info!(pipeline = %pipeline.name, version, "Deployed pipeline");
    }

    let total = count_lines(&args.input_file).await?;
    info!(
        "Inserting {} documents from '{}' into {}",
        total,
        args.input_file.display(),
        client.base_url()
    );
    let pb = create_progress_bar(
        total,
        "Inserting",
        "{spinner:.green} [{elapsed_precise}] {msg} [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})",
    );
    let start = Instant::now();
    let (inserted, errors) = insert_documents(&client, &args.input_file, &pb).await?;
    pb.finish_with_message(format!("Inserted {} documents", inserted));

    info!(
        inserted,
        errors,
        "Finished in {}",
        HumanDuration(start.elapsed())
    );
    match client.status().await {
        Ok(status) => info!(
            active = status.active_count,
            archived = status.archive_count,
            "Node status"
        ),
        Err(e) => warn!("Could not fetch node status: {}", e),
    }
    Ok(())
}
