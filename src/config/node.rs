use crate::error::{PipelineError, Result};
use crate::store::ArchivalPolicy;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Command-line arguments of the node binary (store, protocol server, supervisor).
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the node configuration YAML file. Defaults apply when absent.
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Pipeline definition YAML to deploy on startup.
    #[arg(short = 'p', long)]
    pub pipeline: Option<PathBuf>,

    /// Overrides `server.bind` from the config file.
    #[arg(long)]
    pub bind: Option<String>,

    /// Run only the store and protocol server, without launching stage workers.
    #[arg(long)]
    pub no_supervisor: bool,

    /// Directory for daily-rotated log files. Logs go to stdout only when unset.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub json_logs: bool,

    /// Validate the configuration (and pipeline, if given) and exit.
    #[arg(long)]
    pub validate_config: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub store: StoreConfig,
    pub server: ServerConfig,
    pub supervisor: SupervisorConfig,
}

impl NodeConfig {
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.server.validate()?;
        self.supervisor.validate()?;
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    pub archive_max_count: usize,
    pub archive_max_bytes: usize,
    /// Claims older than this, with no later touch, become claimable again. `None` disables expiry.
    pub lease_timeout_ms: Option<u64>,
    pub archive_policy: ArchivalPolicy,
    /// DELETE documents are archived once any output stage has touched them.
    pub archive_consumed_deletes: bool,
    pub snapshot_path: Option<PathBuf>,
    pub flush_interval_secs: u64,
    pub rollover_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            archive_max_count: 1000,
            archive_max_bytes: 64 * 1024 * 1024,
            lease_timeout_ms: Some(300_000),
            archive_policy: ArchivalPolicy::default(),
            archive_consumed_deletes: true,
            snapshot_path: None,
            flush_interval_secs: 5,
            rollover_interval_secs: 10,
        }
    }
}

impl StoreConfig {
    pub fn lease_timeout(&self) -> Option<Duration> {
        self.lease_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.archive_max_count == 0 {
            return Err(PipelineError::ConfigValidationError(
                "StoreConfig: archive_max_count must be greater than 0".to_string(),
            ));
        }
        if self.archive_max_bytes == 0 {
            return Err(PipelineError::ConfigValidationError(
                "StoreConfig: archive_max_bytes must be greater than 0".to_string(),
            ));
        }
        if self.lease_timeout_ms == Some(0) {
            return Err(PipelineError::ConfigValidationError(
                "StoreConfig: lease_timeout_ms must be greater than 0 (omit it to disable leases)"
                    .to_string(),
            ));
        }
        if self.flush_interval_secs == 0 || self.rollover_interval_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "StoreConfig: flush_interval_secs and rollover_interval_secs must be greater than 0"
                    .to_string(),
            ));
        }
        if let ArchivalPolicy::StagesTouched(stages) = &self.archive_policy {
            if stages.is_empty() {
                return Err(PipelineError::ConfigValidationError(
                    "StoreConfig: stages_touched policy needs at least one stage".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub artifact_dir: PathBuf,
    /// Files attached to individual documents, removed once the document leaves the store.
    pub attachment_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: "127.0.0.1:12001".to_string(),
            artifact_dir: PathBuf::from("data/artifacts"),
            attachment_dir: PathBuf::from("data/attachments"),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        self.bind
            .parse::<std::net::SocketAddr>()
            .map_err(|e| {
                PipelineError::ConfigValidationError(format!(
                    "ServerConfig: bind '{}' is not a socket address: {}",
                    self.bind, e
                ))
            })?;
        if self.attachment_dir == self.artifact_dir {
            return Err(PipelineError::ConfigValidationError(format!(
                "ServerConfig: attachment_dir and artifact_dir must differ, both are '{}'",
                self.artifact_dir.display()
            )));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    pub poll_interval_secs: u64,
    pub max_restarts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub stop_timeout_secs: u64,
    /// Per-stage working directories; artifacts are materialized here.
    pub namespace_dir: PathBuf,
    /// Executable used for stages without an artifact.
    pub worker_program: PathBuf,
    /// URL workers use to reach the protocol server. Derived from `server.bind` when unset.
    pub server_url: Option<String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            poll_interval_secs: 60,
            max_restarts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            stop_timeout_secs: 10,
            namespace_dir: PathBuf::from("data/stages"),
            worker_program: PathBuf::from("worker"),
            server_url: None,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "SupervisorConfig: poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_base_ms > self.backoff_max_ms {
            return Err(PipelineError::ConfigValidationError(format!(
                "SupervisorConfig: backoff_base_ms ({}) must be > 0 and <= backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.stop_timeout_secs == 0 {
            return Err(PipelineError::ConfigValidationError(
                "SupervisorConfig: stop_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Loads and validates the node configuration from a YAML file.
pub fn load_node_config<P: AsRef<Path>>(config_path: P) -> Result<NodeConfig> {
    let path_ref = config_path.as_ref();
    let config_content = fs::read_to_string(path_ref).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to read node config file '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    let config: NodeConfig = serde_yaml::from_str(&config_content).map_err(|e| {
        PipelineError::ConfigError(format!(
            "Failed to parse node config YAML from '{}': {}",
            path_ref.display(),
            e
        ))
    })?;

    config.validate()?;
    Ok(config)
}
