// SPDX-License-Identifier: Apache-2.0

//! The fallback sink: always active, writes a structured representation of
//! the trace to the tracing subscriber. Never fails — there is no
//! downstream to fail against.

use tracing::info;

use super::RequestTraceReporter;
use crate::trace::RequestTrace;

pub struct LogReporter;

#[async_trait::async_trait]
impl RequestTraceReporter for LogReporter {
    fn is_active(&self, _trace: &RequestTrace) -> bool {
        true
    }

    async fn report_request_trace(&self, trace: &RequestTrace) -> anyhow::Result<()> {
        info!(
            request_id = %trace.id,
            request_name = %trace.name(),
            execution_time_ms = trace.execution_time_ms(),
            cpu_time_ms = trace.cpu_time_ms(),
            db_execution_time_ms = trace.db_execution_time_ms(),
            execution_count_db = trace.execution_count_db(),
            is_error = trace.is_error(),
            "request trace"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}
