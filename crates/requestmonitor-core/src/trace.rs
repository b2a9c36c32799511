// SPDX-License-Identifier: Apache-2.0

//! The request trace: an immutable-after-publish record of one monitored
//! execution's measurements and metadata.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Mutex,
};

use crate::callstack::CallStackElement;

/// A trace's name, resolved either eagerly or lazily via a callback. The
/// callback resolves at most once; the result is memoized.
pub enum Name {
    Eager(String),
    Deferred(Box<dyn FnOnce() -> String + Send>),
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Name::Eager(s) => write!(f, "Name::Eager({s:?})"),
            Name::Deferred(_) => write!(f, "Name::Deferred(..)"),
        }
    }
}

/// A captured workload failure: a message plus an optionally-rendered
/// source chain, kept as data rather than a live `dyn Error` so a
/// `RequestTrace` remains `Send` and trivially reportable/serializable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedError {
    pub message: String,
    pub chain: Vec<String>,
}

impl CapturedError {
    pub fn from_display(err: &(impl std::fmt::Display + ?Sized)) -> Self {
        Self {
            message: err.to_string(),
            chain: Vec::new(),
        }
    }

    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            chain,
        }
    }
}

/// HTTP-specific fields of a trace, populated only by HTTP-flavored
/// adapters. Kept out of the base measurement state so method-call and
/// task adapters never allocate a map they'll never touch.
#[derive(Debug, Clone, Default)]
pub struct HttpRequestTraceExt {
    pub url: Option<String>,
    pub method: Option<String>,
    pub status_code: Option<u16>,
    pub bytes_written: Option<u64>,
    pub client_ip: Option<String>,
    pub username: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub session_id: Option<String>,
    pub connection_id: Option<String>,
    pub widget_visible: bool,
}

impl HttpRequestTraceExt {
    /// Zeroes the host part of `client_ip` when anonymization is enabled
    /// (`requestmonitor.anonymizeIPs`): the last octet for IPv4, the last 80
    /// bits for IPv6. Applied by the monitor just before `onPostExecute`, so
    /// adapters and reporters only ever observe the anonymized value.
    pub fn anonymize_client_ip(&mut self) {
        if let Some(ip) = &self.client_ip {
            self.client_ip = Some(crate::net::anonymize_ip(ip));
        }
    }
}

#[derive(Debug, Default)]
struct Measurements {
    execution_time_ms: f64,
    cpu_time_ms: f64,
    db_execution_time_ms: f64,
    execution_count_db: u64,
    is_error: bool,
    captured_error: Option<CapturedError>,
    call_stack: Option<CallStackElement>,
}

/// One per monitored execution. Measurement fields live behind a mutex
/// rather than plain struct fields: user code reached through
/// `getCurrentRequest()` observes the same trace the engine is still
/// finalizing, so mutation has to go through a shared reference rather than
/// requiring exclusive ownership. Once the trace is handed to the reporter
/// pipeline, callers do not retain references past that point, so further
/// mutation is forbidden by discipline rather than the type system.
pub struct RequestTrace {
    pub id: String,
    name: Mutex<Option<Name>>,
    measurements: Mutex<Measurements>,
    http: Mutex<Option<HttpRequestTraceExt>>,
}

impl RequestTrace {
    pub fn new(id: impl Into<String>, name: Name) -> Self {
        Self {
            id: id.into(),
            name: Mutex::new(Some(name)),
            measurements: Mutex::new(Measurements::default()),
            http: Mutex::new(None),
        }
    }

    /// Resolves and memoizes the name on first call. A trace whose resolved
    /// name is empty is treated as "do not monitor" by the engine.
    pub fn name(&self) -> String {
        let mut guard = self.name.lock().unwrap();
        match guard.take() {
            Some(Name::Eager(s)) => {
                *guard = Some(Name::Eager(s.clone()));
                s
            }
            Some(Name::Deferred(f)) => {
                let resolved = f();
                *guard = Some(Name::Eager(resolved.clone()));
                resolved
            }
            None => unreachable!("name is always restored after resolution"),
        }
    }

    /// Forces eager resolution of the name right now (used by adapters that
    /// need the name before execution finishes, e.g. to decide whether to
    /// set up HTTP-specific fields).
    pub fn resolve_name_eagerly(&self) {
        let _ = self.name();
    }

    pub fn set_timings(&self, execution_time_ms: f64, cpu_time_ms: f64) {
        let mut m = self.measurements.lock().unwrap();
        m.execution_time_ms = execution_time_ms;
        m.cpu_time_ms = cpu_time_ms;
    }

    pub fn record_error(&self, error: CapturedError) {
        let mut m = self.measurements.lock().unwrap();
        m.is_error = true;
        m.captured_error = Some(error);
    }

    pub fn record_db(&self, db_time_ms: f64, operation_count: u64) {
        let mut m = self.measurements.lock().unwrap();
        m.db_execution_time_ms += db_time_ms;
        m.execution_count_db += operation_count;
    }

    pub fn set_call_stack(&self, root: CallStackElement) {
        self.measurements.lock().unwrap().call_stack = Some(root);
    }

    pub fn set_http(&self, http: HttpRequestTraceExt) {
        *self.http.lock().unwrap() = Some(http);
    }

    pub fn with_http_mut<R>(&self, f: impl FnOnce(&mut HttpRequestTraceExt) -> R) -> Option<R> {
        self.http.lock().unwrap().as_mut().map(f)
    }

    pub fn execution_time_ms(&self) -> f64 {
        self.measurements.lock().unwrap().execution_time_ms
    }

    pub fn cpu_time_ms(&self) -> f64 {
        self.measurements.lock().unwrap().cpu_time_ms
    }

    pub fn db_execution_time_ms(&self) -> f64 {
        self.measurements.lock().unwrap().db_execution_time_ms
    }

    pub fn execution_count_db(&self) -> u64 {
        self.measurements.lock().unwrap().execution_count_db
    }

    pub fn is_error(&self) -> bool {
        self.measurements.lock().unwrap().is_error
    }

    pub fn captured_error(&self) -> Option<CapturedError> {
        self.measurements.lock().unwrap().captured_error.clone()
    }

    pub fn call_stack(&self) -> Option<CallStackElement> {
        self.measurements.lock().unwrap().call_stack.clone()
    }

    pub fn http(&self) -> Option<HttpRequestTraceExt> {
        self.http.lock().unwrap().clone()
    }

    /// Renders the trace as a JSON document for the Elasticsearch reporter.
    pub fn to_json(&self) -> serde_json::Value {
        let m = self.measurements.lock().unwrap();
        let mut doc = serde_json::json!({
            "id": self.id,
            "name": self.name(),
            "executionTime": m.execution_time_ms,
            "cpuTime": m.cpu_time_ms,
            "dbExecutionTime": m.db_execution_time_ms,
            "executionCountDb": m.execution_count_db,
            "error": m.is_error,
        });
        if let Some(captured) = &m.captured_error {
            doc["errorMessage"] = serde_json::json!(captured.message);
            doc["errorChain"] = serde_json::json!(captured.chain);
        }
        drop(m);
        if let Some(http) = self.http.lock().unwrap().as_ref() {
            doc["url"] = serde_json::json!(http.url);
            doc["method"] = serde_json::json!(http.method);
            doc["statusCode"] = serde_json::json!(http.status_code);
            doc["bytesWritten"] = serde_json::json!(http.bytes_written);
            doc["clientIp"] = serde_json::json!(http.client_ip);
            doc["username"] = serde_json::json!(http.username);
            doc["headers"] = serde_json::json!(http.headers);
            doc["parameters"] = serde_json::json!(http.parameters);
            doc["sessionId"] = serde_json::json!(http.session_id);
            doc["connectionId"] = serde_json::json!(http.connection_id);
            doc["widgetVisible"] = serde_json::json!(http.widget_visible);
        }
        doc
    }
}

impl fmt::Debug for RequestTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestTrace")
            .field("id", &self.id)
            .field("execution_time_ms", &self.execution_time_ms())
            .field("cpu_time_ms", &self.cpu_time_ms())
            .field("is_error", &self.is_error())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_name_round_trips() {
        let trace = RequestTrace::new("1", Name::Eager("Report Me".into()));
        assert_eq!(trace.name(), "Report Me");
        assert_eq!(trace.name(), "Report Me");
    }

    #[test]
    fn deferred_name_resolves_once_and_memoizes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let trace = RequestTrace::new(
            "1",
            Name::Deferred(Box::new(move || {
                calls_clone.fetch_add(1, Ordering::SeqCst);
                "Lazy Name".to_string()
            })),
        );

        assert_eq!(trace.name(), "Lazy Name");
        assert_eq!(trace.name(), "Lazy Name");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_name_is_treated_as_do_not_monitor() {
        let trace = RequestTrace::new("1", Name::Eager(String::new()));
        assert!(trace.name().is_empty());
    }

    #[test]
    fn record_db_accumulates_across_calls() {
        let trace = RequestTrace::new("1", Name::Eager("x".into()));
        trace.record_db(1.5, 2);
        trace.record_db(2.5, 3);
        assert_eq!(trace.db_execution_time_ms(), 4.0);
        assert_eq!(trace.execution_count_db(), 5);
    }

    #[test]
    fn record_error_marks_trace_as_failed() {
        let trace = RequestTrace::new("1", Name::Eager("x".into()));
        assert!(!trace.is_error());
        trace.record_error(CapturedError::from_display("boom"));
        assert!(trace.is_error());
        assert_eq!(trace.captured_error().unwrap().message, "boom");
    }
}
