// SPDX-License-Identifier: Apache-2.0

//! The reporter pipeline: an ordered, dynamically registrable set of
//! reporters drained by a single-threaded bounded-queue worker, so a slow
//! or failing sink never blocks the request thread.

pub mod elasticsearch_reporter;
pub mod log_reporter;

pub use elasticsearch_reporter::ElasticsearchReporter;
pub use log_reporter::LogReporter;

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tracing::warn;

use crate::trace::RequestTrace;

/// An adapter that drains finished traces to an external destination.
#[async_trait::async_trait]
pub trait RequestTraceReporter: Send + Sync {
    /// Whether this reporter wants to see `trace` at all. Consulted before
    /// every `report_request_trace` call; a reporter can be active for one
    /// trace and not another (e.g. a name filter) without becoming globally
    /// inactive.
    fn is_active(&self, trace: &RequestTrace) -> bool;

    /// Drains one trace. Failures are swallowed by the pipeline and logged
    /// — they never propagate to the monitored request.
    async fn report_request_trace(&self, trace: &RequestTrace) -> anyhow::Result<()>;

    /// A short name used in log lines when this reporter fails.
    fn name(&self) -> &'static str;
}

/// Process-wide, ordered list of reporters. Registration prepends (most
/// recently added is inspected first); iteration takes an immutable
/// snapshot so concurrent registration never blocks or races with a reader.
#[derive(Default)]
pub struct ReporterList {
    reporters: ArcSwap<Vec<Arc<dyn RequestTraceReporter>>>,
}

impl ReporterList {
    pub fn new() -> Self {
        Self {
            reporters: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Prepends `reporter` so it is inspected before any previously
    /// registered reporter. Preserves prepend semantics intentionally —
    /// existing deployments depend on newly added reporters taking
    /// priority over ones registered earlier.
    pub fn add(&self, reporter: Arc<dyn RequestTraceReporter>) {
        self.reporters.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.push(reporter.clone());
            next.extend(current.iter().cloned());
            next
        });
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn RequestTraceReporter>>> {
        self.reporters.load_full()
    }
}

/// Submits a trace to every active reporter in list order, swallowing and
/// logging individual reporter failures.
pub async fn dispatch(reporters: &[Arc<dyn RequestTraceReporter>], trace: &RequestTrace) {
    for reporter in reporters {
        if !reporter.is_active(trace) {
            continue;
        }
        if let Err(err) = reporter.report_request_trace(trace).await {
            warn!(reporter = reporter.name(), error = %err, "reporter failed; continuing with remaining reporters");
        }
    }
}

/// A single-worker, bounded-queue async pipeline. The monitor hands off a
/// finished trace here; submission never blocks the request thread —
/// rejection (queue full, worker shut down) is logged and the trace is
/// dropped.
pub struct ReporterPipeline {
    sender: mpsc::Sender<RequestTrace>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl ReporterPipeline {
    pub fn new(reporters: Arc<ReporterList>, queue_capacity: usize) -> Self {
        let (sender, mut receiver) = mpsc::channel::<RequestTrace>(queue_capacity.max(1));
        let worker = tokio::spawn(async move {
            while let Some(trace) = receiver.recv().await {
                let snapshot = reporters.snapshot();
                dispatch(&snapshot, &trace).await;
            }
        });
        Self {
            sender,
            worker: Some(worker),
        }
    }

    /// Non-blocking submission. Returns immediately; on a full queue or a
    /// shut-down worker, logs a rejection warning and drops the trace —
    /// never blocks or fails the caller.
    pub fn submit(&self, trace: RequestTrace) {
        match self.sender.try_send(trace) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("reporter queue full; dropping trace");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("reporter queue closed; dropping trace");
            }
        }
    }

    /// Requests graceful shutdown: stops accepting new submissions and
    /// drains whatever is already queued, then stops. Traces submitted
    /// before this call are not dropped by shutdown itself — only overflow
    /// causes a drop.
    pub async fn close(mut self) {
        drop(self.sender);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::trace::Name;

    struct CountingReporter {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl RequestTraceReporter for CountingReporter {
        fn is_active(&self, _trace: &RequestTrace) -> bool {
            true
        }

        async fn report_request_trace(&self, _trace: &RequestTrace) -> anyhow::Result<()> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[tokio::test]
    async fn registering_a_reporter_twice_invokes_it_twice() {
        let count = Arc::new(AtomicUsize::new(0));
        let list = ReporterList::new();
        list.add(Arc::new(CountingReporter {
            count: count.clone(),
        }));
        list.add(Arc::new(CountingReporter {
            count: count.clone(),
        }));

        let trace = RequestTrace::new("1", Name::Eager("x".into()));
        dispatch(&list.snapshot(), &trace).await;

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn prepend_means_latest_registration_is_inspected_first() {
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        struct OrderRecorder {
            order: Arc<parking_lot::Mutex<Vec<&'static str>>>,
            label: &'static str,
        }

        #[async_trait::async_trait]
        impl RequestTraceReporter for OrderRecorder {
            fn is_active(&self, _trace: &RequestTrace) -> bool {
                true
            }
            async fn report_request_trace(&self, _trace: &RequestTrace) -> anyhow::Result<()> {
                self.order.lock().push(self.label);
                Ok(())
            }
            fn name(&self) -> &'static str {
                self.label
            }
        }

        let list = ReporterList::new();
        list.add(Arc::new(OrderRecorder {
            order: order.clone(),
            label: "first",
        }));
        list.add(Arc::new(OrderRecorder {
            order: order.clone(),
            label: "second",
        }));

        let trace = RequestTrace::new("1", Name::Eager("x".into()));
        dispatch(&list.snapshot(), &trace).await;

        assert_eq!(*order.lock(), vec!["second", "first"]);
    }

    #[tokio::test]
    async fn pipeline_drains_all_submissions_on_close() {
        let count = Arc::new(AtomicUsize::new(0));
        let list = Arc::new(ReporterList::new());
        list.add(Arc::new(CountingReporter {
            count: count.clone(),
        }));

        let pipeline = ReporterPipeline::new(list, 16);
        for i in 0..5 {
            pipeline.submit(RequestTrace::new(i.to_string(), Name::Eager("x".into())));
        }
        pipeline.close().await;

        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
