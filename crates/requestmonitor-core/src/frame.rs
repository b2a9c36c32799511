// SPDX-License-Identifier: Apache-2.0

//! The per-thread current-request register and the engine-internal
//! execution frame ("RequestInformation").
//!
//! Frames form a singly-linked ancestry chain via an explicit `parent`
//! field; "is this frame forwarding to a nested call" is tracked as a
//! boolean flag the nested call's `push` sets on its parent, rather than a
//! `child` pointer, since nothing ever needs to dereference the child —
//! only whether one exists.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use crate::trace::RequestTrace;

/// One pushed execution frame. Lives from `monitorStart` to `monitorStop`;
/// popped in `monitorStop` regardless of how `execute()` returned.
pub struct Frame {
    pub(crate) parent: Option<Arc<Frame>>,
    has_child: AtomicBool,
    trace: RefCell<Option<Arc<RequestTrace>>>,
    pub start: Instant,
    pub start_cpu_ns: u64,
    pub first_request: bool,
    awaits_startup: AtomicBool,
}

impl Frame {
    fn new(parent: Option<Arc<Frame>>, start_cpu_ns: u64, first_request: bool) -> Self {
        Self {
            parent,
            has_child: AtomicBool::new(false),
            trace: RefCell::new(None),
            start: Instant::now(),
            start_cpu_ns,
            first_request,
            awaits_startup: AtomicBool::new(false),
        }
    }

    /// Marks that this frame triggered (or observed in-flight) agent
    /// start-up, so `monitorStop` knows to wait for it before reporting.
    pub fn mark_awaits_startup(&self) {
        self.awaits_startup.store(true, Ordering::Release);
    }

    pub fn awaits_startup(&self) -> bool {
        self.awaits_startup.load(Ordering::Acquire)
    }

    pub fn is_forwarded(&self) -> bool {
        self.parent.is_some()
    }

    pub fn is_forwarding(&self) -> bool {
        self.has_child.load(Ordering::Acquire)
    }

    pub fn set_trace(&self, trace: Arc<RequestTrace>) {
        *self.trace.borrow_mut() = Some(trace);
    }

    pub fn trace(&self) -> Option<Arc<RequestTrace>> {
        self.trace.borrow().clone()
    }

    /// Takes the frame's trace, leaving `None` behind. Used by `monitorStop`
    /// to drop the frame's own strong reference before deciding whether the
    /// trace can be handed to the reporter pipeline by value.
    pub fn take_trace(&self) -> Option<Arc<RequestTrace>> {
        self.trace.borrow_mut().take()
    }
}

thread_local! {
    static STACK: RefCell<Vec<Arc<Frame>>> = RefCell::new(Vec::new());
}

/// Pushes a new frame, linking it to the prior top (if any) as parent, and
/// marking the prior top as forwarding. Returns the new frame, already
/// installed as the per-thread current top.
///
/// `first_request` should be `true` only for the very first frame pushed on
/// the process (per the accepted race in the warm-up design note: two
/// threads may both observe `first_request = true` under concurrency).
pub fn push(start_cpu_ns: u64, first_request: bool) -> Arc<Frame> {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let parent = stack.last().cloned();
        if let Some(parent) = &parent {
            parent.has_child.store(true, Ordering::Release);
        }
        let frame = Arc::new(Frame::new(parent, start_cpu_ns, first_request));
        stack.push(frame.clone());
        frame
    })
}

/// Pops the per-thread top, restoring its parent as the new top. The popped
/// frame's identity is not checked against `expected` beyond a debug
/// assertion — LIFO discipline is a caller invariant, not something this
/// function can repair.
pub fn pop(expected: &Arc<Frame>) {
    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        debug_assert!(
            stack.last().map(Arc::as_ptr) == Some(Arc::as_ptr(expected)),
            "monitorStop popped a frame that was not the current top"
        );
        stack.pop();
    });
}

/// Returns the trace of the innermost active frame on this thread, if any.
/// This is `getCurrentRequest()`: `None` both when no monitoring is active
/// and when the active frame's admission did not pass (no trace exists).
pub fn current_trace() -> Option<Arc<RequestTrace>> {
    STACK.with(|stack| stack.borrow().last().and_then(|f| f.trace()))
}

/// Clears the per-thread stack entirely. Used by `RequestMonitor::close()`
/// for the calling thread, and as a defensive reset; never needed on the
/// happy path since `pop` is paired with every `push`.
pub fn clear() {
    STACK.with(|stack| stack.borrow_mut().clear());
}

#[cfg(test)]
pub(crate) fn depth() -> usize {
    STACK.with(|stack| stack.borrow().len())
}
