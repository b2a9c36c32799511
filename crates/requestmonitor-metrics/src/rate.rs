// SPDX-License-Identifier: Apache-2.0

//! A one-minute exponentially-decaying rate meter, used by the
//! Elasticsearch reporter's admission rule. Ticks in ~5 second windows
//! rather than recomputing continuously, trading a little precision for a
//! meter that never needs more than an atomic counter and a timestamp on
//! the hot path.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

const TICK_INTERVAL_NS: u64 = 5_000_000_000; // 5 seconds
const ONE_MINUTE_SECS: f64 = 60.0;

/// `alpha` for an EWMA that decays over a 5s tick window towards a 1-minute
/// average, i.e. `1 - exp(-tick_interval / window)`.
fn alpha(window_secs: f64) -> f64 {
    1.0 - (-((TICK_INTERVAL_NS as f64 / 1_000_000_000.0) / window_secs)).exp()
}

/// Tracks events-per-minute with ~5s update granularity.
///
/// Mirrors the well-known "forward-decaying" meter used by metrics
/// libraries such as Dropwizard: events are counted in an uncounted buffer
/// between ticks; each tick folds the buffer into an exponentially weighted
/// moving average and resets it. Reading the rate between ticks returns the
/// rate as of the last tick, not a live extrapolation — tests that mark and
/// immediately read must advance the clock past a tick boundary first.
pub struct RateMeter {
    alpha: f64,
    uncounted: AtomicI64,
    rate_per_sec_bits: AtomicU64,
    last_tick_ns: AtomicU64,
    start_ns: AtomicU64,
    tick_lock: Mutex<()>,
    clock: Box<dyn Fn() -> u64 + Send + Sync>,
}

impl RateMeter {
    /// Builds a meter decaying towards a one-minute window, using
    /// `std::time::Instant`-relative nanoseconds as its clock.
    pub fn new() -> Self {
        Self::with_clock(default_clock)
    }

    /// Builds a meter with an injectable clock so tests can advance time
    /// deterministically instead of sleeping for real minutes.
    pub fn with_clock(clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        let now = clock();
        Self {
            alpha: alpha(ONE_MINUTE_SECS),
            uncounted: AtomicI64::new(0),
            rate_per_sec_bits: AtomicU64::new(0f64.to_bits()),
            last_tick_ns: AtomicU64::new(now),
            start_ns: AtomicU64::new(now),
            tick_lock: Mutex::new(()),
            clock: Box::new(clock),
        }
    }

    pub fn mark(&self) {
        self.mark_n(1);
    }

    pub fn mark_n(&self, n: i64) {
        self.tick_if_needed();
        self.uncounted.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns the current one-minute rate, in events/minute, as of the last
    /// tick boundary.
    pub fn one_minute_rate_per_minute(&self) -> f64 {
        self.tick_if_needed();
        f64::from_bits(self.rate_per_sec_bits.load(Ordering::Relaxed)) * ONE_MINUTE_SECS
    }

    fn tick_if_needed(&self) {
        let now = (self.clock)();
        let last = self.last_tick_ns.load(Ordering::Relaxed);
        if now <= last || now - last < TICK_INTERVAL_NS {
            return;
        }

        let _serialize = self.tick_lock.lock();
        // Re-check under the lock: another thread may have ticked already.
        let last = self.last_tick_ns.load(Ordering::Relaxed);
        if now <= last || now - last < TICK_INTERVAL_NS {
            return;
        }

        let elapsed_ticks = (now - last) / TICK_INTERVAL_NS;
        let instant_rate =
            self.uncounted.swap(0, Ordering::Relaxed) as f64 / (TICK_INTERVAL_NS as f64 / 1_000_000_000.0);

        let mut rate = f64::from_bits(self.rate_per_sec_bits.load(Ordering::Relaxed));
        // First tick seeds the average directly instead of decaying from 0.
        let warming_up = last == self.start_ns.load(Ordering::Relaxed) && rate == 0.0;
        if warming_up {
            rate = instant_rate;
        } else {
            rate += self.alpha * (instant_rate - rate);
        }
        // Any further whole ticks with no events decay the rate towards zero.
        for _ in 1..elapsed_ticks {
            rate += self.alpha * (0.0 - rate);
        }

        self.rate_per_sec_bits
            .store(rate.to_bits(), Ordering::Relaxed);
        self.last_tick_ns
            .store(last + elapsed_ticks * TICK_INTERVAL_NS, Ordering::Relaxed);
    }
}

impl Default for RateMeter {
    fn default() -> Self {
        Self::new()
    }
}

fn default_clock() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use super::*;

    fn fake_clock() -> (Arc<AtomicU64>, impl Fn() -> u64) {
        let now = Arc::new(AtomicU64::new(0));
        let read = now.clone();
        (now, move || read.load(Ordering::Relaxed))
    }

    #[test]
    fn marks_before_first_tick_are_not_yet_reflected() {
        let (now, clock) = fake_clock();
        let meter = RateMeter::with_clock(clock);
        meter.mark();
        // No tick has elapsed yet: rate is still the initial zero.
        let _ = now; // clock starts at 0, matches last_tick_ns
        assert_eq!(meter.one_minute_rate_per_minute(), 0.0);
    }

    #[test]
    fn one_mark_then_tick_reports_a_positive_rate() {
        let (now, clock) = fake_clock();
        let meter = RateMeter::with_clock(clock);
        meter.mark();
        now.store(TICK_INTERVAL_NS + 1, Ordering::Relaxed);
        assert!(meter.one_minute_rate_per_minute() > 0.0);
    }

    #[test]
    fn rate_one_per_tick_suppressed_on_second_immediate_submission() {
        // rate limit of 1/minute, two submissions ~5.01s apart.
        let (now, clock) = fake_clock();
        let meter = RateMeter::with_clock(clock);

        meter.mark();
        now.store(TICK_INTERVAL_NS + 10_000_000, Ordering::Relaxed); // +5.01s
        let rate_after_first = meter.one_minute_rate_per_minute();
        assert!(rate_after_first > 1.0, "rate was {rate_after_first}");

        meter.mark();
        // Still within the same 5s tick window: rate does not change yet,
        // so the second submission is evaluated against the already-elevated
        // rate and gets suppressed by the reporter's limit check.
        let rate_after_second = meter.one_minute_rate_per_minute();
        assert!(rate_after_second > 1.0, "rate was {rate_after_second}");
    }

    #[test]
    fn decays_towards_zero_with_no_events() {
        let (now, clock) = fake_clock();
        let meter = RateMeter::with_clock(clock);
        meter.mark_n(100);
        now.store(TICK_INTERVAL_NS + 1, Ordering::Relaxed);
        let first = meter.one_minute_rate_per_minute();

        now.store(2 * TICK_INTERVAL_NS + 1, Ordering::Relaxed);
        let second = meter.one_minute_rate_per_minute();
        assert!(second < first, "{second} should be < {first}");
    }
}
