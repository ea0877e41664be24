// Utils

pub mod common;
pub mod prometheus_metrics;
pub mod utils;

pub use common::{backoff_delay, init_tracing, shutdown_signal};
pub use utils::{metrics_handler, setup_prometheus_metrics};
