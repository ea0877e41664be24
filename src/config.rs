// src/config.rs

pub mod node;
pub mod pipeline;
pub mod producer;
pub mod worker;

pub use node::{load_node_config, NodeConfig, ServerConfig, StoreConfig, SupervisorConfig};
pub use pipeline::{load_pipeline_definition, StepConfig};
