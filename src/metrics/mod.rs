//! Prometheus metrics for the prevalence pipeline
//!
//! Each stage owns a submodule with its metric names and recording helpers.
//! Recording is a no-op until a recorder is installed, so library users and
//! tests pay nothing unless `init_metrics` runs.

pub mod cache;
pub mod ingestion;
pub mod processing;
pub mod registry;

pub use cache::CacheMetrics;
pub use ingestion::LoaderMetrics;
pub use processing::{DeriverMetrics, HarmonizerMetrics};

use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

static INSTALLED: OnceLock<()> = OnceLock::new();
static HANDLE: OnceLock<metrics_exporter_prometheus::PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// With an address the exporter serves `/metrics` over HTTP from a background
/// thread; without one the recorder is in-process only and `render` produces
/// the exposition text. Idempotent.
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    if INSTALLED.get().is_some() {
        return Ok(());
    }

    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match addr {
        Some(addr) => {
            let socket: SocketAddr = addr
                .parse()
                .map_err(|e| PipelineError::Config(format!("Invalid metrics addr '{}': {}", addr, e)))?;
            builder
                .with_http_listener(socket)
                .install()
                .map_err(|e| PipelineError::Config(format!("Failed to install Prometheus exporter: {}", e)))?;
            info!("Prometheus exporter listening at http://{}/metrics", socket);
        }
        None => match builder.install_recorder() {
            Ok(handle) => {
                let _ = HANDLE.set(handle);
                info!("Prometheus recorder installed (in-process only)");
            }
            Err(e) => {
                warn!("Failed to install Prometheus recorder: {}", e);
                return Ok(());
            }
        },
    }

    let _ = INSTALLED.set(());
    registry::register_all_metrics();
    Ok(())
}

/// Exposition text of the in-process recorder, if one is installed
pub fn render() -> Option<String> {
    HANDLE.get().map(|h| h.render())
}

/// Metric names and pre-registration for one pipeline stage
pub trait PhaseMetrics {
    /// Touch every metric so it appears in the exposition before first use
    fn register_metrics();

    fn phase_name() -> &'static str;

    fn metric_names() -> Vec<&'static str>;
}

/// Build a metric name following `atlas_{phase}_{name}[_total]`
macro_rules! phase_metric {
    (counter, $phase:literal, $name:literal) => {
        concat!("atlas_", $phase, "_", $name, "_total")
    };
    (histogram, $phase:literal, $name:literal) => {
        concat!("atlas_", $phase, "_", $name)
    };
    (gauge, $phase:literal, $name:literal) => {
        concat!("atlas_", $phase, "_", $name)
    };
}

pub(crate) use phase_metric;
