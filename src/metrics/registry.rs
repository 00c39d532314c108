//! Registration of every stage's metrics, with duplicate-name detection

use std::collections::HashMap;
use tracing::{info, warn};

use crate::metrics::{CacheMetrics, DeriverMetrics, HarmonizerMetrics, LoaderMetrics, PhaseMetrics};

pub fn register_all_metrics() {
    let mut seen: HashMap<&'static str, &'static str> = HashMap::new();

    register_phase::<LoaderMetrics>(&mut seen);
    register_phase::<HarmonizerMetrics>(&mut seen);
    register_phase::<DeriverMetrics>(&mut seen);
    register_phase::<CacheMetrics>(&mut seen);

    info!("Registered {} metrics across all phases", seen.len());
}

fn register_phase<T: PhaseMetrics>(seen: &mut HashMap<&'static str, &'static str>) {
    T::register_metrics();
    let phase = T::phase_name();
    for name in T::metric_names() {
        if let Some(existing) = seen.insert(name, phase) {
            warn!("Metric '{}' is defined by both '{}' and '{}'", name, existing, phase);
        }
    }
}
