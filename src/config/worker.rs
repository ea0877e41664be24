use std::path::PathBuf;

use clap::Parser;

/// Arguments for a stage worker. The node's supervisor passes the first three.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Base URL of the node's coordination server
    #[arg(short, long, default_value = "http://127.0.0.1:12001")]
    pub server_url: String,

    /// Name of the stage this worker runs
    #[arg(long)]
    pub stage: String,

    /// Finish the current document and exit once stdin is closed
    #[arg(long)]
    pub stop_on_stdin_eof: bool,

    /// Verbose logging; set for DEBUG-mode stages
    #[arg(long)]
    pub debug: bool,

    /// Optional: Port for the Prometheus metrics HTTP endpoint
    #[arg(long)]
    pub metrics_port: Option<u16>,

    /// Write logs to a daily-rotated file in this directory instead of stdout
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}
