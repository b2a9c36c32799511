// SPDX-License-Identifier: Apache-2.0

//! Drives the request-monitoring core against two synthetic adapters: a
//! plain method-call adapter (monitors the outermost caller) and a pair of
//! HTTP-style adapters where an outer handler forwards to an inner one
//! (monitors only the innermost).

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use prometheus::Registry;
use requestmonitor_core::{
    trace::HttpRequestTraceExt, MonitoredRequest, Name, RequestMonitor, RequestMonitorConfig,
    RequestTrace, StaticConfigurationSource,
};
use requestmonitor_metrics::MetricRegistry;

fn next_request_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("demo-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, thiserror::Error)]
enum DemoError {
    #[error("division by zero")]
    DivisionByZero,
}

/// A plain method-call workload: not forwarded, not forwarding.
struct ComputeQuotient {
    dividend: i64,
    divisor: i64,
}

impl MonitoredRequest for ComputeQuotient {
    type Output = i64;
    type Error = DemoError;

    fn create_request_trace(&self) -> RequestTrace {
        RequestTrace::new(next_request_id(), Name::Eager("ComputeQuotient".into()))
    }

    fn execute(&mut self) -> Result<Self::Output, Self::Error> {
        if self.divisor == 0 {
            return Err(DemoError::DivisionByZero);
        }
        Ok(self.dividend / self.divisor)
    }

    fn is_monitor_forwarded_executions(&self) -> bool {
        false
    }
}

/// An HTTP-style handler that forwards to a nested handler, the way a
/// reverse proxy or an internal redirect would. `is_monitor_forwarded_executions`
/// is `true` here, so only the innermost of the two gets reported.
struct ProxyHandler<'a> {
    monitor: &'a RequestMonitor,
    client_ip: &'static str,
}

impl<'a> MonitoredRequest for ProxyHandler<'a> {
    type Output = u16;
    type Error = DemoError;

    fn create_request_trace(&self) -> RequestTrace {
        let trace = RequestTrace::new(next_request_id(), Name::Eager("GET /api/proxy".into()));
        trace.set_http(HttpRequestTraceExt {
            method: Some("GET".into()),
            url: Some("/api/proxy".into()),
            client_ip: Some(self.client_ip.into()),
            ..Default::default()
        });
        trace
    }

    fn execute(&mut self) -> Result<Self::Output, Self::Error> {
        self.monitor.monitor(UsersHandler {
            client_ip: self.client_ip,
        })
    }

    fn on_post_execute(&mut self, trace: &RequestTrace) {
        trace.with_http_mut(|http| http.status_code = Some(200));
    }

    fn is_monitor_forwarded_executions(&self) -> bool {
        true
    }
}

struct UsersHandler {
    client_ip: &'static str,
}

impl MonitoredRequest for UsersHandler {
    type Output = u16;
    type Error = DemoError;

    fn create_request_trace(&self) -> RequestTrace {
        let trace = RequestTrace::new(next_request_id(), Name::Eager("GET /api/users".into()));
        trace.set_http(HttpRequestTraceExt {
            method: Some("GET".into()),
            url: Some("/api/users".into()),
            client_ip: Some(self.client_ip.into()),
            ..Default::default()
        });
        trace
    }

    fn execute(&mut self) -> Result<Self::Output, Self::Error> {
        std::thread::sleep(std::time::Duration::from_millis(2));
        Ok(200)
    }

    fn on_post_execute(&mut self, trace: &RequestTrace) {
        trace.with_http_mut(|http| http.status_code = Some(200));
    }

    fn is_monitor_forwarded_executions(&self) -> bool {
        true
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    requestmonitor_core::logging::init();

    let config = RequestMonitorConfig::from_source(
        &StaticConfigurationSource::new()
            .with("stagemonitor.active", "true")
            .with("application.name", "requestmonitor-demo")
            .with("requestmonitor.collectRequestStats", "true")
            .with("requestmonitor.collectCpuTime", "true")
            .with("requestmonitor.profiler.active", "true")
            .with("requestmonitor.profiler.callStackEveryXRequestsToGroup", "1")
            .with("requestmonitor.anonymizeIPs", "true"),
    );
    let metrics = Arc::new(MetricRegistry::new(Registry::new()));
    let monitor = RequestMonitor::new(config, metrics);

    monitor.add_on_before_request_callback(|| tracing::debug!("before request"));
    monitor.add_on_after_request_callback(|| tracing::debug!("after request"));

    for (dividend, divisor) in [(10, 2), (9, 3), (5, 0)] {
        match monitor.monitor(ComputeQuotient { dividend, divisor }) {
            Ok(quotient) => tracing::info!(quotient, "computed"),
            Err(err) => tracing::warn!(%err, "computation failed"),
        }
    }

    monitor.monitor(ProxyHandler {
        monitor: &monitor,
        client_ip: "203.0.113.42",
    })?;

    monitor.close().await;
    Ok(())
}
