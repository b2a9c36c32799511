// SPDX-License-Identifier: Apache-2.0

//! Configuration is an external collaborator: some *source* supplies typed
//! values on demand. The core only needs the [`ConfigurationSource`] trait;
//! [`StaticConfigurationSource`] is a minimal concrete implementation so the
//! crate's own tests and `demos/` binary have something to construct.

use std::collections::{BTreeMap, HashSet};

use serde::Deserialize;

use crate::error::MonitorError;

/// Typed, on-demand access to configuration values (load once, read many),
/// as a trait so callers can swap in whatever configuration mechanism their
/// host application already uses.
pub trait ConfigurationSource: Send + Sync {
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn get_i64(&self, key: &str, default: i64) -> i64;
    fn get_f64(&self, key: &str, default: f64) -> f64;
    fn get_string(&self, key: &str, default: &str) -> String;
    fn get_string_set(&self, key: &str) -> HashSet<String>;
}

/// An in-memory configuration source backed by a flat string map. Typed
/// getters parse on read and fall back to `default` on a missing key or a
/// parse failure (configuration error → treat the dependent feature as
/// disabled, per the error-handling design).
#[derive(Debug, Clone, Default)]
pub struct StaticConfigurationSource {
    values: BTreeMap<String, String>,
}

impl StaticConfigurationSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Loads a flat `key: value` YAML document (values may be any scalar;
    /// they are stringified and re-parsed by the typed getters).
    pub fn from_yaml(document: &str) -> Result<Self, MonitorError> {
        let raw: BTreeMap<String, serde_yaml::Value> = serde_yaml::from_str(document)?;
        let values = raw
            .into_iter()
            .map(|(k, v)| (k, scalar_to_string(&v)))
            .collect();
        Ok(Self { values })
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}

impl ConfigurationSource for StaticConfigurationSource {
    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.values
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.values
            .get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    fn get_string_set(&self, key: &str) -> HashSet<String> {
        self.values
            .get(key)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A cached snapshot of every `requestmonitor.*`/`stagemonitor.*` key the
/// core consults, read once at [`crate::monitor::RequestMonitor::new`] time
/// so the hot path never touches the configuration source again.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestMonitorConfig {
    pub active: bool,
    pub internal_monitoring: bool,

    pub application_name: String,
    pub instance_name: Option<String>,
    pub elasticsearch_url: Option<String>,

    pub warmup_requests: i64,
    pub warmup_seconds: i64,

    pub collect_request_stats: bool,
    pub collect_cpu_time: bool,
    pub collect_db_time_per_request: bool,

    pub profiler_active: bool,
    pub call_stack_every_x_requests_to_group: i64,
    pub min_execution_time_percent: f64,

    pub anonymize_ips: bool,

    pub only_report_n_requests_per_minute_to_elasticsearch: i64,
    pub only_report_requests_with_name: HashSet<String>,

    pub thread_pool_queue_capacity_limit: usize,
}

impl RequestMonitorConfig {
    pub fn from_source(source: &dyn ConfigurationSource) -> Self {
        Self {
            active: source.get_bool("stagemonitor.active", true),
            internal_monitoring: source.get_bool("stagemonitor.internal.monitoring", false),

            application_name: source.get_string("application.name", "unknown"),
            instance_name: {
                let v = source.get_string("instance.name", "");
                if v.is_empty() { None } else { Some(v) }
            },
            elasticsearch_url: {
                let v = source.get_string("elasticsearch.url", "");
                if v.is_empty() { None } else { Some(v) }
            },

            warmup_requests: source.get_i64("requestmonitor.warmupRequests", 0),
            warmup_seconds: source.get_i64("requestmonitor.warmupSeconds", 0),

            collect_request_stats: source.get_bool("requestmonitor.collectRequestStats", true),
            collect_cpu_time: source.get_bool("requestmonitor.collectCpuTime", false),
            collect_db_time_per_request: source
                .get_bool("requestmonitor.collectDbTimePerRequest", false),

            profiler_active: source.get_bool("requestmonitor.profiler.active", false),
            call_stack_every_x_requests_to_group: source
                .get_i64("requestmonitor.profiler.callStackEveryXRequestsToGroup", 1),
            min_execution_time_percent: source
                .get_f64("requestmonitor.profiler.minExecutionTimePercent", 0.0),

            anonymize_ips: source.get_bool("requestmonitor.anonymizeIPs", false),

            only_report_n_requests_per_minute_to_elasticsearch: source.get_i64(
                "requestmonitor.elasticsearch.onlyReportNRequestsPerMinute",
                i64::MAX,
            ),
            only_report_requests_with_name: source
                .get_string_set("requestmonitor.elasticsearch.onlyReportRequestsWithName"),

            thread_pool_queue_capacity_limit: source
                .get_i64("threadPool.queueCapacityLimit", 1000)
                .max(1) as usize,
        }
    }
}
