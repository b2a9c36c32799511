// SPDX-License-Identifier: Apache-2.0

//! Metric registry primitives for the request-monitoring core.
//!
//! A small [`MetricName`] abstraction lets callers key timers/meters/counters
//! by a base name and a set of tags the way the request monitor needs
//! (`request_name`, `layer`, `http_code`, ...), backed by a single
//! `prometheus::Registry` per [`MetricRegistry`].

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, Registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
};

pub mod rate;

pub use rate::RateMeter;

/// A structured metric name: a base metric and a sorted set of tags.
///
/// Sorting the tags on construction means two `MetricName`s built with tags
/// in a different order still compare/hash equal, which keeps the per-name
/// timer lookup in [`MetricRegistry`] stable regardless of call-site order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricName {
    pub base_name: &'static str,
    pub tags: Vec<(&'static str, String)>,
}

impl MetricName {
    pub fn new(base_name: &'static str, tags: impl IntoIterator<Item = (&'static str, String)>) -> Self {
        let mut tags: Vec<_> = tags.into_iter().collect();
        tags.sort();
        Self { base_name, tags }
    }

    fn label_names(&self) -> Vec<&'static str> {
        self.tags.iter().map(|(k, _)| *k).collect()
    }

    fn label_values(&self) -> Vec<&str> {
        self.tags.iter().map(|(_, v)| v.as_str()).collect()
    }
}

/// Lazily-created, cached families of timers/meters keyed by
/// [`MetricName::base_name`]. Each distinct base name gets exactly one
/// `HistogramVec`/`IntCounterVec` registered with the registry; individual
/// tag combinations are just label values on that family.
pub struct MetricRegistry {
    registry: Registry,
    timers: DashMap<&'static str, HistogramVec>,
    counters: DashMap<&'static str, IntCounterVec>,
}

impl MetricRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            timers: DashMap::new(),
            counters: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records a duration (in nanoseconds, converted to fractional seconds as
    /// Prometheus convention expects) against the timer named by `name`.
    pub fn record_timer_ns(&self, name: &MetricName, elapsed_ns: u64) {
        let histogram = self.timer_for(name);
        histogram.observe(elapsed_ns as f64 / 1_000_000_000.0);
    }

    /// Marks one occurrence on the meter named by `name` (error rate, jdbc
    /// query rate, ...). "Meter" here is modeled as a monotonic counter: a
    /// consumer wanting decaying per-minute rates should read it through
    /// `RateMeter` instead, as the Elasticsearch reporter does for its own
    /// independent rate-limiting decision.
    pub fn mark(&self, name: &MetricName) {
        self.mark_n(name, 1);
    }

    pub fn mark_n(&self, name: &MetricName, count: u64) {
        self.counter_for(name).inc_by(count);
    }

    pub fn timer_count(&self, name: &MetricName) -> u64 {
        self.timer_for(name).get_sample_count()
    }

    fn timer_for(&self, name: &MetricName) -> Histogram {
        if let Some(family) = self.timers.get(name.base_name) {
            return family.with_label_values(&name.label_values());
        }
        let label_names = name.label_names();
        let family = register_histogram_vec_with_registry!(
            name.base_name,
            name.base_name,
            &label_names,
            self.registry
        )
        .expect("metric family registration should not fail for a stable label set");
        let histogram = family.with_label_values(&name.label_values());
        self.timers.insert(name.base_name, family);
        histogram
    }

    fn counter_for(&self, name: &MetricName) -> IntCounter {
        if let Some(family) = self.counters.get(name.base_name) {
            return family.with_label_values(&name.label_values());
        }
        let label_names = name.label_names();
        let family = register_int_counter_vec_with_registry!(
            name.base_name,
            name.base_name,
            &label_names,
            self.registry
        )
        .expect("metric family registration should not fail for a stable label set");
        let counter = family.with_label_values(&name.label_values());
        self.counters.insert(name.base_name, family);
        counter
    }
}

static OVERHEAD_REGISTRY: OnceCell<Mutex<()>> = OnceCell::new();

fn overhead_lock() -> &'static Mutex<()> {
    OVERHEAD_REGISTRY.get_or_init(|| Mutex::new(()))
}

/// Tracks the monitor's own overhead (time spent inside `monitorStart` +
/// `monitorStop`) into a dedicated timer, accumulating two disjoint spans
/// instead of one contiguous scope.
pub fn track_overhead(registry: &MetricRegistry, overhead1_ns: u64, overhead2_ns: u64) {
    let _serialize = overhead_lock().lock();
    let name = MetricName::new("internal_overhead_request_monitor", []);
    registry.record_timer_ns(&name, overhead1_ns + overhead2_ns);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_registry_dedupes_family_by_base_name() {
        let registry = Registry::new();
        let metrics = MetricRegistry::new(registry);
        let name_a = MetricName::new("response_time_server", [("request_name", "Foo".to_string())]);
        let name_b = MetricName::new("response_time_server", [("request_name", "Bar".to_string())]);

        metrics.record_timer_ns(&name_a, 1_000_000);
        metrics.record_timer_ns(&name_b, 2_000_000);

        assert_eq!(metrics.timer_count(&name_a), 1);
        assert_eq!(metrics.timer_count(&name_b), 1);
    }

    #[test]
    fn metric_name_tag_order_does_not_affect_identity() {
        let a = MetricName::new("x", [("b", "2".to_string()), ("a", "1".to_string())]);
        let b = MetricName::new("x", [("a", "1".to_string()), ("b", "2".to_string())]);
        assert_eq!(a, b);
    }
}
