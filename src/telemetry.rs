//! Tracing setup and step timing.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Log output format selected with `--log-format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_filter(verbose: bool) -> EnvFilter {
    let level = if verbose { "debug" } else { "info" };
    EnvFilter::new(format!("shipwright={},warn", level))
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("reqwest=warn".parse().expect("static directive"))
}

/// Install the global subscriber. `RUST_LOG` wins over `verbose`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    let result = match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .with(filter)
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Render a duration the way step logs show it: `850ms`, `2.35s`.
pub fn format_duration(elapsed: Duration) -> String {
    let ms = elapsed.as_millis();
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}

/// Run one numbered pipeline step, logging its duration.
///
/// Steps slower than `warn_after` are logged at `WARN`; failures are logged
/// at `ERROR` with the elapsed time before the error is returned unchanged.
pub async fn timed_step<T, E, F>(
    step: usize,
    total: usize,
    label: &str,
    warn_after: Option<Duration>,
    fut: F,
) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    tracing::debug!(step, total, "[START] {}", label);

    let result = fut.await;
    let elapsed = started.elapsed();
    let elapsed_ms = elapsed.as_millis() as u64;

    match &result {
        Ok(_) if warn_after.is_some_and(|limit| elapsed > limit) => {
            tracing::warn!(step, total, elapsed_ms, "[SLOW] {}: {}", label, format_duration(elapsed));
        }
        Ok(_) => {
            tracing::info!(step, total, elapsed_ms, "[DONE] {}: {}", label, format_duration(elapsed));
        }
        Err(e) => {
            tracing::error!(step, total, elapsed_ms, error = %e, "[ERROR] {}", label);
        }
    }

    result
}
