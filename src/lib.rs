#![allow(non_snake_case)]
#![allow(clippy::too_many_arguments)]

pub mod client;
pub mod config;
pub mod data_model;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod query;
pub mod server;
pub mod status;
pub mod store;
pub mod supervisor;
pub mod utils;
pub mod worker_logic;

pub use error::{PipelineError, Result};
