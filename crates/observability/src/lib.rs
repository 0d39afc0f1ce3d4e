//! Process-wide logging and metrics setup for modelwatch binaries.

use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the global subscriber. Stdout carries command output, so logs
/// go to stderr. `RUST_LOG` wins over `default_level`.
pub fn init_tracing(
    service_name: &str,
    default_level: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("{service_name}={default_level},{default_level}"))
    });

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .try_init()
        .ok()?;

    Some(guard)
}

/// Installs the Prometheus recorder once; later calls return the same handle.
/// There is no scrape listener, callers render the text themselves.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    Ok(PROM_HANDLE.get_or_init(|| handle).clone())
}

pub fn render_metrics() -> Option<String> {
    PROM_HANDLE.get().map(PrometheusHandle::render)
}
