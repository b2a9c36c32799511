// SPDX-License-Identifier: Apache-2.0

//! Request-monitoring core: instruments a monitored execution, measures its
//! wall-clock and (where supported) CPU time, optionally profiles its
//! call-stack tree, emits metrics, and dispatches a finished trace to
//! pluggable reporters without blocking the instrumented workload.

pub mod adapter;
pub mod callstack;
pub mod config;
pub mod cpu_time;
pub mod error;
pub mod frame;
pub mod logging;
pub mod monitor;
pub mod net;
pub mod reporter;
pub mod session;
pub mod startup;
pub mod trace;

pub use adapter::MonitoredRequest;
pub use config::{ConfigurationSource, RequestMonitorConfig, StaticConfigurationSource};
pub use error::MonitorError;
pub use monitor::RequestMonitor;
pub use reporter::{ElasticsearchReporter, LogReporter, RequestTraceReporter};
pub use trace::{CapturedError, HttpRequestTraceExt, Name, RequestTrace};
