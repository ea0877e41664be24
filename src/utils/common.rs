// src/utils/common.rs

use rand::Rng;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
///
/// With `log_dir` set, logs go to a daily-rotated file instead of stdout and the
/// returned guard must be kept alive until exit so buffered lines are flushed.
pub fn init_tracing(log_dir: Option<&Path>, json: bool, default_level: &str) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "docrelay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = fmt::Subscriber::builder()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            Some(guard)
        }
        None => {
            let builder = fmt::Subscriber::builder().with_env_filter(filter);
            if json {
                builder.json().init();
            } else {
                builder.init();
            }
            None
        }
    }
}

/// Exponential backoff with "equal jitter": the result lies in `[d/2, d]` where
/// `d = min(base * 2^(attempt-1), max)`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    let delay = base.saturating_mul(factor).min(max);
    let half = delay / 2;
    let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
    half + Duration::from_millis(jitter_ms)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(1000);
        for attempt in 1..20 {
            let d = backoff_delay(attempt, base, max);
            let cap = (base * 2u32.saturating_pow(attempt - 1)).min(max);
            assert!(d >= cap / 2 && d <= cap, "attempt {} gave {:?}", attempt, d);
        }
        assert!(backoff_delay(0, base, max) <= base);
    }
}
