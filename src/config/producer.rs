use std::path::PathBuf;

use clap::Parser;

/// Arguments for the producer, which feeds documents into a running node.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to a JSON Lines file; each line is a document or a bare contents object
    #[arg(short, long)]
    pub input_file: PathBuf,

    /// Base URL of the node's coordination server
    #[arg(short, long, default_value = "http://127.0.0.1:12001")]
    pub server_url: String,

    /// Pipeline definition (YAML) to deploy before inserting
    #[arg(short, long)]
    pub pipeline: Option<PathBuf>,

    /// Upload this file as an artifact and print its id, then continue
    #[arg(long)]
    pub artifact: Option<PathBuf>,

    /// Optional: Port for the Prometheus metrics HTTP endpoint
    #[arg(long)]
    pub metrics_port: Option<u16>,
}
