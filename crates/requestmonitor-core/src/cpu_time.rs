// SPDX-License-Identifier: Apache-2.0

//! Per-thread CPU time, when the platform exposes it.

/// Nanoseconds of CPU time consumed by the calling thread so far, or `None`
/// on platforms without a thread-CPU-time clock. Callers should probe this
/// once and cache the result rather than branching on it per-call.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn current_thread_cpu_time_ns() -> Option<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return None;
    }
    Some(ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn current_thread_cpu_time_ns() -> Option<u64> {
    None
}

/// Whether this platform can report thread CPU time at all. Evaluated once
/// at monitor construction and cached, so the hot path never re-probes.
pub fn is_supported() -> bool {
    current_thread_cpu_time_ns().is_some()
}
