// SPDX-License-Identifier: Apache-2.0

//! The contract a caller implements to drive one monitored execution.
//! Adapters are the boundary between the core and a specific workload
//! (HTTP, method call, task); the core never knows which.

use crate::trace::RequestTrace;

/// Adapter between the core and a specific workload.
///
/// `Output` is whatever `execute()` produces on success; `Error` is the
/// workload's own error type, which is the only kind of error allowed to
/// escape `RequestMonitor::monitor`.
pub trait MonitoredRequest {
    type Output;
    type Error: std::error::Error + 'static;

    /// Used once to name the process instance if not already configured.
    fn instance_name(&self) -> Option<String> {
        None
    }

    /// Called after admission checks, before execution.
    fn create_request_trace(&self) -> RequestTrace;

    /// The actual workload.
    fn execute(&mut self) -> Result<Self::Output, Self::Error>;

    /// Called after timing stops, before reporting — the hook where
    /// adapters populate post-hoc fields (e.g. HTTP status code). Takes a
    /// shared reference because the same trace may still be visible to
    /// instrumented code through `getCurrentRequest()`; use the trace's
    /// interior-mutable setters rather than requiring exclusive ownership.
    fn on_post_execute(&mut self, trace: &RequestTrace) {
        let _ = trace;
    }

    /// Policy for nested/forwarded calls: `true` to monitor the innermost
    /// dispatched handler (typical for HTTP), `false` to monitor the
    /// outermost caller (typical for method-call instrumentation).
    fn is_monitor_forwarded_executions(&self) -> bool;
}
