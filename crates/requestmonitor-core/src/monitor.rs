// SPDX-License-Identifier: Apache-2.0

//! The request monitor: owns the lifecycle of one monitored execution —
//! start/stop, nested-request detection, timing, metric emission, warm-up,
//! and dispatch to the reporter pipeline.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use requestmonitor_metrics::{track_overhead, MetricName, MetricRegistry};
use scopeguard::guard;
use tracing::warn;

use crate::{
    adapter::MonitoredRequest,
    callstack,
    config::RequestMonitorConfig,
    cpu_time,
    frame::{self, Frame},
    reporter::{ElasticsearchReporter, LogReporter, ReporterList, ReporterPipeline, RequestTraceReporter},
    session::SessionBootstrap,
    startup::Startup,
    trace::{CapturedError, RequestTrace},
};

fn forwarding_admission(is_forwarded: bool, is_forwarding: bool, monitor_forwarded_executions: bool) -> bool {
    match (is_forwarded, is_forwarding) {
        (false, false) => true,
        (true, true) => false,
        (true, false) => monitor_forwarded_executions,
        (false, true) => !monitor_forwarded_executions,
    }
}

struct WarmupState {
    warmup_requests: i64,
    end_of_warmup: Instant,
    warmed_up: AtomicBool,
    no_of_requests: AtomicI64,
}

impl WarmupState {
    fn new(warmup_requests: i64, warmup_seconds: i64) -> Self {
        Self {
            warmup_requests,
            end_of_warmup: Instant::now() + Duration::from_secs(warmup_seconds.max(0) as u64),
            warmed_up: AtomicBool::new(false),
            no_of_requests: AtomicI64::new(0),
        }
    }

    fn request_count(&self) -> i64 {
        self.no_of_requests.load(Ordering::Relaxed)
    }

    /// Increments the request counter as a side effect even once already
    /// warmed up is `false` on this call. Call this at most once per
    /// request — the counter is also consulted separately to decide
    /// `firstRequest`, which is the accepted race: two threads may both
    /// observe `firstRequest = true` under concurrency.
    fn is_warmed_up(&self) -> bool {
        if self.warmed_up.load(Ordering::Acquire) {
            return true;
        }
        let n = self.no_of_requests.fetch_add(1, Ordering::AcqRel) + 1;
        let warmed = n > self.warmup_requests && Instant::now() >= self.end_of_warmup;
        if warmed {
            self.warmed_up.store(true, Ordering::Release);
        }
        warmed
    }
}

/// State carried from `monitorStart` to `monitorStop` for one execution.
struct StartOutcome {
    frame: Arc<Frame>,
    t0: Instant,
    stats_and_warmup_ok: bool,
    trace: Option<Arc<RequestTrace>>,
    profiling_started: bool,
    overhead1_ns: u64,
    first_request: bool,
}

/// Engine that measures monitored executions and drives the reporter
/// pipeline. One instance owns its own reporter list, metric registry
/// handle, and thread pool — tests construct isolated instances rather than
/// sharing process-wide static state.
pub struct RequestMonitor {
    config: RequestMonitorConfig,
    metrics: Arc<MetricRegistry>,
    reporters: Arc<ReporterList>,
    pipeline: ReporterPipeline,
    session: SessionBootstrap,
    startup: Startup,
    cpu_time_supported: bool,
    warmup: WarmupState,
    request_counts: DashMap<String, std::sync::atomic::AtomicU64>,
    before_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
    after_callbacks: Mutex<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl RequestMonitor {
    pub fn new(config: RequestMonitorConfig, metrics: Arc<MetricRegistry>) -> Self {
        let reporters = Arc::new(ReporterList::new());
        reporters.add(Arc::new(LogReporter));
        if config.elasticsearch_url.is_some() {
            reporters.add(Arc::new(ElasticsearchReporter::new(
                config.elasticsearch_url.clone(),
                "requests",
                config.only_report_requests_with_name.clone(),
                config.only_report_n_requests_per_minute_to_elasticsearch,
            )));
        }
        let pipeline = ReporterPipeline::new(reporters.clone(), config.thread_pool_queue_capacity_limit);
        let cpu_time_supported = config.collect_cpu_time && cpu_time::is_supported();
        let warmup = WarmupState::new(config.warmup_requests, config.warmup_seconds);

        Self {
            metrics,
            reporters,
            pipeline,
            session: SessionBootstrap::new(),
            startup: Startup::new(),
            cpu_time_supported,
            warmup,
            request_counts: DashMap::new(),
            before_callbacks: Mutex::new(Vec::new()),
            after_callbacks: Mutex::new(Vec::new()),
            config,
        }
    }

    pub fn add_request_trace_reporter(&self, reporter: Arc<dyn RequestTraceReporter>) {
        self.reporters.add(reporter);
    }

    pub fn add_on_before_request_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.before_callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn add_on_after_request_callback(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.after_callbacks.lock().unwrap().push(Box::new(callback));
    }

    /// `getCurrentRequest()`.
    pub fn current_request() -> Option<Arc<RequestTrace>> {
        frame::current_trace()
    }

    /// Runs `adapter.execute()` under full instrumentation, returning the
    /// adapter's own result. The only error type that escapes this call is
    /// the adapter's `Error` — instrumentation/reporting failures are
    /// logged and swallowed.
    pub fn monitor<A: MonitoredRequest>(&self, mut adapter: A) -> Result<A::Output, A::Error> {
        let outcome = self.monitor_start(&adapter);
        let executed = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| adapter.execute()));
        match executed {
            Ok(result) => {
                let workload_error = result.as_ref().err().map(|e| CapturedError::from_error(e));
                self.monitor_stop(outcome, &mut adapter, workload_error);
                result
            }
            Err(panic) => {
                self.monitor_stop(
                    outcome,
                    &mut adapter,
                    Some(CapturedError::from_display("workload panicked")),
                );
                std::panic::resume_unwind(panic);
            }
        }
    }

    fn monitor_start<A: MonitoredRequest>(&self, adapter: &A) -> StartOutcome {
        let t0 = Instant::now();
        let start_cpu_ns = if self.cpu_time_supported {
            cpu_time::current_thread_cpu_time_ns().unwrap_or(0)
        } else {
            0
        };

        // Read before `is_warmed_up()` increments it: the accepted race
        // between this read and the warm-up counter.
        let first_request = self.warmup.request_count() == 0;
        let frame = frame::push(start_cpu_ns, first_request);

        // Guards against a panic anywhere below leaking the just-pushed
        // frame; defused once this function returns normally.
        let guarded_frame = guard(frame.clone(), |f| {
            warn!("monitorStart panicked; popping stray frame");
            frame::pop(&f);
        });

        if !self.config.active {
            scopeguard::ScopeGuard::into_inner(guarded_frame);
            return StartOutcome {
                frame,
                t0,
                stats_and_warmup_ok: false,
                trace: None,
                profiling_started: false,
                overhead1_ns: 0,
                first_request,
            };
        }

        self.bootstrap_session(adapter);

        let stats_and_warmup_ok = self.config.collect_request_stats && self.warmup.is_warmed_up();
        let tentative_admitted = stats_and_warmup_ok
            && forwarding_admission(
                frame.is_forwarded(),
                frame.is_forwarding(),
                adapter.is_monitor_forwarded_executions(),
            );

        if !tentative_admitted {
            let overhead1_ns = t0.elapsed().as_nanos() as u64;
            scopeguard::ScopeGuard::into_inner(guarded_frame);
            return StartOutcome {
                frame,
                t0,
                stats_and_warmup_ok,
                trace: None,
                profiling_started: false,
                overhead1_ns,
                first_request,
            };
        }

        if !self.startup.is_complete() {
            self.startup.trigger_if_needed(|| {});
            frame.mark_awaits_startup();
        }

        let trace = Arc::new(adapter.create_request_trace());
        frame.set_trace(trace.clone());

        let profiling_started = self.profile_this_request(&trace);
        if profiling_started {
            callstack::activate_profiling("total");
        }

        self.run_callbacks(&self.before_callbacks, "onBeforeRequest");

        let overhead1_ns = t0.elapsed().as_nanos() as u64;
        scopeguard::ScopeGuard::into_inner(guarded_frame);
        StartOutcome {
            frame,
            t0,
            stats_and_warmup_ok,
            trace: Some(trace),
            profiling_started,
            overhead1_ns,
            first_request,
        }
    }

    fn monitor_stop<A: MonitoredRequest>(
        &self,
        outcome: StartOutcome,
        adapter: &mut A,
        workload_error: Option<CapturedError>,
    ) {
        let stop_entered_at = Instant::now();
        frame::pop(&outcome.frame);

        let final_admitted = outcome.stats_and_warmup_ok
            && forwarding_admission(
                outcome.frame.is_forwarded(),
                outcome.frame.is_forwarding(),
                adapter.is_monitor_forwarded_executions(),
            );

        let report_this = final_admitted
            && outcome
                .trace
                .as_ref()
                .map(|t| !t.name().is_empty())
                .unwrap_or(false);

        if report_this {
            let trace = outcome.trace.as_ref().expect("report_this implies a trace");

            // The frame keeps its own clone alive for `getCurrentRequest()`
            // lookups during `execute()`; drop it now that the frame is
            // popped, so the only strong reference left is `outcome.trace`
            // and `Arc::try_unwrap` below can actually succeed.
            outcome.frame.take_trace();

            if outcome.frame.awaits_startup() {
                self.startup.wait();
            }

            let execution_time_ns = outcome.t0.elapsed().as_nanos() as u64;
            let cpu_time_ns = if self.cpu_time_supported {
                cpu_time::current_thread_cpu_time_ns()
                    .unwrap_or(outcome.frame.start_cpu_ns)
                    .saturating_sub(outcome.frame.start_cpu_ns)
            } else {
                0
            };
            trace.set_timings(
                execution_time_ns as f64 / 1_000_000.0,
                cpu_time_ns as f64 / 1_000_000.0,
            );
            if let Some(error) = workload_error {
                trace.record_error(error);
            }
            if self.config.anonymize_ips {
                trace.with_http_mut(|http| http.anonymize_client_ip());
            }

            adapter.on_post_execute(trace);

            if outcome.profiling_started {
                if let Some(mut root) = callstack::stop() {
                    root.signature = trace.name();
                    if self.config.min_execution_time_percent > 0.0 {
                        let threshold =
                            (root.total_ns as f64 * self.config.min_execution_time_percent / 100.0) as u64;
                        root.remove_calls_faster_than(threshold);
                    }
                    trace.set_call_stack(root);
                }
            }

            self.emit_metrics(trace, execution_time_ns, cpu_time_ns);
        } else if outcome.profiling_started {
            // The tentative admission at `monitorStart` didn't survive to
            // `monitorStop` (the frame turned out to be forwarding); drop
            // the in-progress tree instead of leaking it into the next
            // reuse of this pooled thread.
            callstack::clear_method_call_parent();
        }

        if let Some(trace) = outcome.trace {
            if report_this {
                match Arc::try_unwrap(trace) {
                    Ok(trace) => self.pipeline.submit(trace),
                    Err(_) => {
                        warn!("trace still referenced outside the monitor; dropping instead of reporting")
                    }
                }
            }
        }

        if !outcome.first_request && self.config.internal_monitoring {
            let overhead2_ns = stop_entered_at.elapsed().as_nanos() as u64;
            track_overhead(&self.metrics, outcome.overhead1_ns, overhead2_ns);
        }

        self.run_callbacks(&self.after_callbacks, "onAfterRequest");
    }

    fn bootstrap_session<A: MonitoredRequest>(&self, adapter: &A) {
        let host_name = local_host_name();
        let session = self.session.get_or_create(
            &self.config.application_name,
            &host_name,
            self.config.instance_name.clone(),
        );
        if session.instance_name.is_none() {
            if let Some(name) = adapter.instance_name() {
                self.session.upgrade_instance_name(name);
            }
        }
    }

    fn profile_this_request(&self, trace: &RequestTrace) -> bool {
        if !self.config.profiler_active {
            return false;
        }
        let n = self.config.call_stack_every_x_requests_to_group;
        if n < 1 {
            return false;
        }
        let name = trace.name();
        let prior_count = self
            .request_counts
            .get(&name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0);
        let grouping_ok = n == 1 || (prior_count != 0 && prior_count % n as u64 == 0);
        if !grouping_ok {
            return false;
        }
        self.reporters.snapshot().iter().any(|r| r.is_active(trace))
    }

    fn emit_metrics(&self, trace: &RequestTrace, execution_time_ns: u64, cpu_time_ns: u64) {
        let name = trace.name();
        self.request_counts
            .entry(name.clone())
            .or_insert_with(|| std::sync::atomic::AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let per_name = MetricName::new(
            "response_time_server",
            [("request_name", name.clone()), ("layer", "All".to_string())],
        );
        let aggregate = MetricName::new(
            "response_time_server",
            [("request_name", "All".to_string()), ("layer", "All".to_string())],
        );
        self.metrics.record_timer_ns(&per_name, execution_time_ns);
        self.metrics.record_timer_ns(&aggregate, execution_time_ns);

        if self.config.collect_cpu_time {
            let cpu_per_name = MetricName::new(
                "response_time_cpu",
                [("request_name", name.clone()), ("layer", "All".to_string())],
            );
            let cpu_aggregate = MetricName::new(
                "response_time_cpu",
                [("request_name", "All".to_string()), ("layer", "All".to_string())],
            );
            self.metrics.record_timer_ns(&cpu_per_name, cpu_time_ns);
            self.metrics.record_timer_ns(&cpu_aggregate, cpu_time_ns);
        }

        if trace.is_error() {
            let err_per_name = MetricName::new(
                "error_rate_server",
                [("request_name", name.clone()), ("layer", "All".to_string())],
            );
            let err_aggregate = MetricName::new(
                "error_rate_server",
                [("request_name", "All".to_string()), ("layer", "All".to_string())],
            );
            self.metrics.mark(&err_per_name);
            self.metrics.mark(&err_aggregate);
        }

        if trace.execution_count_db() > 0 {
            let db_ns = (trace.db_execution_time_ms() * 1_000_000.0) as u64;
            let db_aggregate = MetricName::new(
                "response_time_server",
                [("request_name", "All".to_string()), ("layer", "jdbc".to_string())],
            );
            self.metrics.record_timer_ns(&db_aggregate, db_ns);

            if self.config.collect_db_time_per_request {
                let db_per_name = MetricName::new(
                    "response_time_server",
                    [("request_name", name.clone()), ("layer", "jdbc".to_string())],
                );
                self.metrics.record_timer_ns(&db_per_name, db_ns);
            }

            let jdbc_rate = MetricName::new("jdbc_query_rate", [("request_name", name)]);
            self.metrics.mark_n(&jdbc_rate, trace.execution_count_db());
        }
    }

    fn run_callbacks(&self, callbacks: &Mutex<Vec<Box<dyn Fn() + Send + Sync>>>, phase: &'static str) {
        let callbacks = callbacks.lock().unwrap();
        for callback in callbacks.iter() {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback())).is_err() {
                warn!(phase, "callback panicked; continuing");
            }
        }
    }

    /// Graceful shutdown: clears the calling thread's per-thread stack and
    /// drains the reporter pipeline. In-flight workloads on other threads
    /// complete naturally; this does not cancel them.
    pub async fn close(self) {
        frame::clear();
        self.pipeline.close().await;
    }
}

fn local_host_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        adapter::MonitoredRequest,
        config::{RequestMonitorConfig, StaticConfigurationSource},
        trace::Name,
    };
    use prometheus::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::convert::Infallible;

    fn config(overrides: &[(&str, &str)]) -> RequestMonitorConfig {
        let mut source = StaticConfigurationSource::new()
            .with("stagemonitor.active", "true")
            .with("requestmonitor.collectRequestStats", "true");
        for (k, v) in overrides {
            source = source.with(*k, *v);
        }
        RequestMonitorConfig::from_source(&source)
    }

    fn monitor(overrides: &[(&str, &str)]) -> RequestMonitor {
        RequestMonitor::new(config(overrides), Arc::new(MetricRegistry::new(Registry::new())))
    }

    struct SimpleAdapter {
        name: &'static str,
        forwarded_policy: bool,
        body: Box<dyn FnMut() -> Result<(), Infallible> + Send>,
    }

    impl MonitoredRequest for SimpleAdapter {
        type Output = ();
        type Error = Infallible;

        fn create_request_trace(&self) -> RequestTrace {
            RequestTrace::new(uuid::Uuid::new_v4().to_string(), Name::Eager(self.name.to_string()))
        }

        fn execute(&mut self) -> Result<Self::Output, Self::Error> {
            (self.body)()
        }

        fn is_monitor_forwarded_executions(&self) -> bool {
            self.forwarded_policy
        }
    }

    fn adapter(name: &'static str, forwarded_policy: bool) -> SimpleAdapter {
        SimpleAdapter {
            name,
            forwarded_policy,
            body: Box::new(|| Ok(())),
        }
    }

    #[tokio::test]
    async fn non_nested_call_is_admitted_and_timed() {
        let monitor = monitor(&[]);
        monitor.monitor(adapter("Foo", false)).unwrap();
        let name = MetricName::new(
            "response_time_server",
            [("request_name", "Foo".to_string()), ("layer", "All".to_string())],
        );
        assert_eq!(monitor.metrics.timer_count(&name), 1);
    }

    #[tokio::test]
    async fn nested_method_calls_monitor_only_the_outermost() {
        let monitor = Arc::new(monitor(&[]));
        let inner_monitor = monitor.clone();
        let outer = SimpleAdapter {
            name: "Outer",
            forwarded_policy: false,
            body: Box::new(move || {
                inner_monitor.monitor(adapter("Inner", false)).unwrap();
                Ok(())
            }),
        };
        monitor.monitor(outer).unwrap();

        let outer_name = MetricName::new(
            "response_time_server",
            [("request_name", "Outer".to_string()), ("layer", "All".to_string())],
        );
        let inner_name = MetricName::new(
            "response_time_server",
            [("request_name", "Inner".to_string()), ("layer", "All".to_string())],
        );
        assert_eq!(monitor.metrics.timer_count(&outer_name), 1);
        assert_eq!(monitor.metrics.timer_count(&inner_name), 0);
    }

    #[tokio::test]
    async fn forwarded_http_style_calls_monitor_only_the_innermost() {
        let monitor = Arc::new(monitor(&[]));
        let inner_monitor = monitor.clone();
        let outer = SimpleAdapter {
            name: "SlashA",
            forwarded_policy: true,
            body: Box::new(move || {
                inner_monitor
                    .monitor(adapter("SlashB", true))
                    .unwrap();
                Ok(())
            }),
        };
        monitor.monitor(outer).unwrap();

        let outer_name = MetricName::new(
            "response_time_server",
            [("request_name", "SlashA".to_string()), ("layer", "All".to_string())],
        );
        let inner_name = MetricName::new(
            "response_time_server",
            [("request_name", "SlashB".to_string()), ("layer", "All".to_string())],
        );
        assert_eq!(monitor.metrics.timer_count(&outer_name), 0);
        assert_eq!(monitor.metrics.timer_count(&inner_name), 1);
    }

    #[tokio::test]
    async fn warmup_suppresses_the_configured_number_of_requests() {
        let monitor = monitor(&[
            ("requestmonitor.warmupRequests", "2"),
            ("requestmonitor.warmupSeconds", "0"),
        ]);
        for _ in 0..2 {
            monitor.monitor(adapter("Foo", false)).unwrap();
        }
        monitor.monitor(adapter("Foo", false)).unwrap();

        let name = MetricName::new(
            "response_time_server",
            [("request_name", "Foo".to_string()), ("layer", "All".to_string())],
        );
        assert_eq!(monitor.metrics.timer_count(&name), 1);
    }

    #[tokio::test]
    async fn empty_name_is_never_reported() {
        let monitor = monitor(&[]);
        monitor.monitor(adapter("", false)).unwrap();
        let name = MetricName::new(
            "response_time_server",
            [("request_name", "".to_string()), ("layer", "All".to_string())],
        );
        assert_eq!(monitor.metrics.timer_count(&name), 0);
    }

    #[tokio::test]
    async fn current_request_is_visible_only_inside_execute() {
        assert!(RequestMonitor::current_request().is_none());
        let monitor = monitor(&[]);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();
        let adapter = SimpleAdapter {
            name: "Foo",
            forwarded_policy: false,
            body: Box::new(move || {
                if RequestMonitor::current_request().is_some() {
                    seen_clone.fetch_add(1, AtomicOrdering::SeqCst);
                }
                Ok(())
            }),
        };
        monitor.monitor(adapter).unwrap();
        assert_eq!(seen.load(AtomicOrdering::SeqCst), 1);
        assert!(RequestMonitor::current_request().is_none());
    }

    #[tokio::test]
    async fn close_drains_the_reporter_pipeline() {
        let monitor = monitor(&[]);
        monitor.monitor(adapter("Foo", false)).unwrap();
        monitor.close().await;
    }

    #[tokio::test]
    async fn per_name_db_timer_is_gated_by_collect_db_time_per_request() {
        let db_adapter = |name: &'static str| SimpleAdapter {
            name,
            forwarded_policy: false,
            body: Box::new(|| {
                RequestMonitor::current_request().unwrap().record_db(5.0, 1);
                Ok(())
            }),
        };

        let aggregate = MetricName::new(
            "response_time_server",
            [("request_name", "All".to_string()), ("layer", "jdbc".to_string())],
        );

        let without_flag = monitor(&[]);
        without_flag.monitor(db_adapter("Foo")).unwrap();
        let per_name_off = MetricName::new(
            "response_time_server",
            [("request_name", "Foo".to_string()), ("layer", "jdbc".to_string())],
        );
        assert_eq!(without_flag.metrics.timer_count(&aggregate), 1);
        assert_eq!(without_flag.metrics.timer_count(&per_name_off), 0);

        let with_flag = monitor(&[("requestmonitor.collectDbTimePerRequest", "true")]);
        with_flag.monitor(db_adapter("Bar")).unwrap();
        let per_name_on = MetricName::new(
            "response_time_server",
            [("request_name", "Bar".to_string()), ("layer", "jdbc".to_string())],
        );
        assert_eq!(with_flag.metrics.timer_count(&per_name_on), 1);
    }

    struct CountingReporter {
        count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl crate::reporter::RequestTraceReporter for CountingReporter {
        fn is_active(&self, _trace: &RequestTrace) -> bool {
            true
        }

        async fn report_request_trace(&self, _trace: &RequestTrace) -> anyhow::Result<()> {
            self.count.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    /// Reproduces the bug where `monitor_stop` could never actually hand a
    /// trace to the pipeline: a registered reporter must see every admitted
    /// call once `close()` has drained the queue, not just a count of zero
    /// dropped traces.
    #[tokio::test]
    async fn a_registered_reporter_receives_every_admitted_trace() {
        let monitor = monitor(&[]);
        let count = Arc::new(AtomicUsize::new(0));
        monitor.add_request_trace_reporter(Arc::new(CountingReporter {
            count: count.clone(),
        }));

        for _ in 0..3 {
            monitor.monitor(adapter("Foo", false)).unwrap();
        }
        monitor.close().await;

        assert_eq!(count.load(AtomicOrdering::SeqCst), 3);
    }
}
