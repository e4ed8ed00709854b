// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The pipeline clock: a monotonic 27 MHz tick source shared by every pipe in
//! a graph, used to stamp and compare `cr.sys`/`cr.prog` timestamps.
//!
//! 27 MHz is the MPEG System Clock Reference unit, chosen so that the clock
//! divides evenly into both common audio sample rates and video frame
//! durations without fractional ticks.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Clock ticks per second. Matches the MPEG system clock reference unit.
pub const UCLOCK_FREQ: u64 = 27_000_000;

/// Sentinel for "no value" in clock-ref arithmetic, matching the source's use
/// of `UINT32_MAX` as `AV_CLOCK_MIN` (a value never reached by a real 27 MHz
/// tick count within any realistic stream lifetime when used as a floor).
pub const AV_CLOCK_MIN: u64 = u32::MAX as u64;

/// Lead time subtracted when anchoring a demuxed stream's first packet onto
/// the pipeline clock, so that downstream pipes have a few seconds of buffer
/// before the stream's nominal start time elapses. Three seconds at 27 MHz.
pub const PCR_OFFSET: u64 = 3 * UCLOCK_FREQ;

/// A monotonic, shareable wall clock stamped in 27 MHz ticks.
///
/// One `UClock` is created per pipeline run and handed to every pipe that
/// needs to stamp a `cr.sys` timestamp; all share the same epoch so
/// timestamps are directly comparable across pipes.
#[derive(Clone)]
pub struct UClock {
    epoch: Instant,
    /// Offset applied to every reading, for pipelines that rebase onto an
    /// external clock source (e.g. an SRT peer's reported start time).
    offset_ticks: Arc<AtomicI64>,
}

impl UClock {
    #[must_use]
    pub fn new() -> Self {
        Self { epoch: Instant::now(), offset_ticks: Arc::new(AtomicI64::new(0)) }
    }

    /// Current time in 27 MHz ticks since this clock's epoch, plus any
    /// configured offset.
    #[must_use]
    pub fn now(&self) -> u64 {
        let elapsed = self.epoch.elapsed();
        let ticks = (elapsed.as_secs() * UCLOCK_FREQ)
            + (u64::from(elapsed.subsec_nanos()) * UCLOCK_FREQ / 1_000_000_000);
        (i64::try_from(ticks).unwrap_or(i64::MAX) + self.offset_ticks.load(Ordering::Relaxed))
            .max(0) as u64
    }

    /// Rebase this clock so that `now()` immediately after the call would
    /// report `new_now_ticks`, without disturbing the rate at which it ticks.
    pub fn rebase(&self, new_now_ticks: u64) {
        let raw = self.epoch.elapsed();
        let raw_ticks = (raw.as_secs() * UCLOCK_FREQ)
            + (u64::from(raw.subsec_nanos()) * UCLOCK_FREQ / 1_000_000_000);
        let offset = i64::try_from(new_now_ticks).unwrap_or(i64::MAX)
            - i64::try_from(raw_ticks).unwrap_or(i64::MAX);
        self.offset_ticks.store(offset, Ordering::Relaxed);
    }

    /// Convert a duration in ticks to a `tokio::time::Duration`.
    #[must_use]
    pub fn ticks_to_duration(ticks: u64) -> std::time::Duration {
        std::time::Duration::from_nanos(ticks.saturating_mul(1_000_000_000) / UCLOCK_FREQ)
    }

    /// Convert a `std::time::Duration` to a tick count.
    #[must_use]
    pub fn duration_to_ticks(d: std::time::Duration) -> u64 {
        (d.as_secs() * UCLOCK_FREQ) + (u64::from(d.subsec_nanos()) * UCLOCK_FREQ / 1_000_000_000)
    }
}

impl Default for UClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonically_nondecreasing() {
        let clock = UClock::new();
        let a = clock.now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn rebase_shifts_subsequent_readings() {
        let clock = UClock::new();
        clock.rebase(UCLOCK_FREQ * 1000);
        assert!(clock.now() >= UCLOCK_FREQ * 1000);
    }

    #[test]
    fn tick_duration_round_trip_is_approximate() {
        let d = std::time::Duration::from_millis(40);
        let ticks = UClock::duration_to_ticks(d);
        let back = UClock::ticks_to_duration(ticks);
        let diff = if back > d { back - d } else { d - back };
        assert!(diff < std::time::Duration::from_micros(10));
    }
}
