// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised by the request-monitoring core's own machinery.
///
/// Workload errors (`adapter.execute()` failing) are never wrapped in this
/// type — `RequestMonitor::monitor` returns the adapter's own error type so
/// the "only the workload's exceptions escape `monitor()`" rule holds.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to parse configuration: {0}")]
    Configuration(#[from] serde_yaml::Error),

    #[error("invalid elasticsearch url: {0}")]
    InvalidElasticsearchUrl(String),

    #[error("reporter queue is shut down")]
    ReporterShutdown,
}
