// SPDX-License-Identifier: Apache-2.0

//! The profiler: builds a hierarchical call-time tree on a per-request
//! basis. Keeps a per-thread pointer to the currently
//! active call node ("method-call parent"); entry into an instrumented
//! sub-call pushes a child and becomes the new parent, exit pops it and
//! records elapsed time.
//!
//! Any internal failure here is swallowed and logged — a profiling failure
//! must never abort the monitored workload.

use std::{cell::RefCell, time::Instant};

use tracing::warn;

/// A node in a per-request call-time tree. Owned exclusively by the
/// `RequestTrace` it was built for.
#[derive(Debug, Clone, PartialEq)]
pub struct CallStackElement {
    pub signature: String,
    pub self_ns: u64,
    pub total_ns: u64,
    pub children: Vec<CallStackElement>,
}

impl CallStackElement {
    fn leaf(signature: String, total_ns: u64) -> Self {
        Self {
            signature,
            self_ns: total_ns,
            total_ns,
            children: Vec::new(),
        }
    }

    /// Removes descendants whose total execution time is below `threshold_ns`,
    /// reparenting surviving descendants to the elided node's parent in
    /// place (stable sibling order). The root is never elided — call this on
    /// the root element, not its children, to get that guarantee.
    pub fn remove_calls_faster_than(&mut self, threshold_ns: u64) {
        self.children = Self::filter_children(std::mem::take(&mut self.children), threshold_ns);
    }

    fn filter_children(children: Vec<CallStackElement>, threshold_ns: u64) -> Vec<CallStackElement> {
        let mut survivors = Vec::with_capacity(children.len());
        for mut child in children {
            child.children = Self::filter_children(std::mem::take(&mut child.children), threshold_ns);
            if child.total_ns < threshold_ns {
                // Elided: promote this node's own (already-filtered) children
                // in its place, preserving order.
                survivors.extend(child.children);
            } else {
                survivors.push(child);
            }
        }
        survivors
    }
}

struct InProgressFrame {
    signature: String,
    start: Instant,
    children: Vec<CallStackElement>,
}

thread_local! {
    static STACK: RefCell<Vec<InProgressFrame>> = RefCell::new(Vec::new());
}

/// Creates a root node and installs it as the current parent for this
/// thread. Any prior, un-stopped root is discarded (profiling failures must
/// not leak across requests sharing a pooled thread).
pub fn activate_profiling(root_signature: impl Into<String>) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        stack.clear();
        stack.push(InProgressFrame {
            signature: root_signature.into(),
            start: Instant::now(),
            children: Vec::new(),
        });
    });
}

/// RAII guard for one instrumented sub-call. Pushes a child of the current
/// parent on creation; pops and records elapsed time on drop, even if the
/// instrumented call unwinds via panic.
pub struct CallGuard {
    armed: bool,
}

impl CallGuard {
    pub fn enter(signature: impl Into<String>) -> Self {
        let signature = signature.into();
        let armed = STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack.is_empty() {
                // No active profiling root: entering a call outside
                // `activate_profiling` is a no-op rather than a panic.
                return false;
            }
            stack.push(InProgressFrame {
                signature,
                start: Instant::now(),
                children: Vec::new(),
            });
            true
        });
        Self { armed }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(pop_and_record));
        if result.is_err() {
            warn!("profiler call-stack pop failed; clearing thread-local state");
            STACK.with(|stack| stack.borrow_mut().clear());
        }
    }
}

fn pop_and_record() {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        // Never pop the root here: `stop()` is what finalizes it.
        if stack.len() <= 1 {
            return;
        }
        let frame = stack.pop().expect("checked len > 1 above");
        let total_ns = frame.start.elapsed().as_nanos() as u64;
        let children_total: u64 = frame.children.iter().map(|c| c.total_ns).sum();
        let element = CallStackElement {
            self_ns: total_ns.saturating_sub(children_total),
            total_ns,
            signature: frame.signature,
            children: frame.children,
        };
        if let Some(parent) = stack.last_mut() {
            parent.children.push(element);
        }
    });
}

/// Closes the active root, returning the finalized tree if profiling was
/// active on this thread. Clears the thread-local stack as a side effect.
pub fn stop() -> Option<CallStackElement> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let root = stack.pop()?;
        // Any frames still above the root (an instrumented call that never
        // unwound its guard) are dropped with their partial children.
        stack.clear();
        let total_ns = root.start.elapsed().as_nanos() as u64;
        let children_total: u64 = root.children.iter().map(|c| c.total_ns).sum();
        Some(CallStackElement {
            self_ns: total_ns.saturating_sub(children_total),
            total_ns,
            signature: root.signature,
            children: root.children,
        })
    })
}

/// Resets the per-thread parent pointer. Idempotent; safe to call from an
/// exceptional-unwind path even if profiling was never activated.
pub fn clear_method_call_parent() {
    STACK.with(|stack| stack.borrow_mut().clear());
}
