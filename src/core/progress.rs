//! Shared monotonic progress value plus the polling ticker that drives it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// A single shared progress scalar in `[0, 100]`.
///
/// Mutated only by increment from any worker thread and polled by the
/// presentation layer; snapshots form a non-decreasing sequence across
/// the whole run. External tool runtimes are unpredictable, so between
/// a stage's floor and its ceiling the value is advanced a bounded step
/// per polling tick and snapped to the ceiling exactly when the stage's
/// workers join.
#[derive(Debug, Clone, Default)]
pub struct Progress {
    value: Arc<AtomicU32>,
}

impl Progress {
    pub fn new() -> Self {
        Progress::default()
    }

    pub fn snapshot(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Raises the value to at least `floor`; lower floors are ignored.
    pub fn set_floor(&self, floor: u32) {
        self.value.fetch_max(floor.min(100), Ordering::SeqCst);
    }

    /// One polling tick: advance by one point but stay strictly below
    /// `ceiling`, which is reserved for [`complete_stage`](Self::complete_stage).
    pub fn advance_towards(&self, ceiling: u32) {
        let cap = ceiling.min(100).saturating_sub(1);
        let _ = self
            .value
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                if v < cap {
                    Some(v + 1)
                } else {
                    None
                }
            });
    }

    /// Snaps to the stage's declared ceiling the instant its workers join.
    pub fn complete_stage(&self, ceiling: u32) {
        self.value.fetch_max(ceiling.min(100), Ordering::SeqCst);
    }
}

/// Background thread that keeps a [`Progress`] moving while a stage's
/// workers are alive.
///
/// Display-only: it is off the critical path, and a delayed or dead
/// ticker never affects pipeline correctness.
pub struct ProgressTicker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    progress: Progress,
    ceiling: u32,
}

impl ProgressTicker {
    pub fn start(progress: Progress, ceiling: u32, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let progress = progress.clone();
            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    std::thread::sleep(interval);
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    progress.advance_towards(ceiling);
                }
            })
        };
        ProgressTicker {
            stop,
            handle,
            progress,
            ceiling,
        }
    }

    /// Stops ticking and snaps to the stage ceiling (successful join).
    pub fn complete(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
        self.progress.complete_stage(self.ceiling);
    }

    /// Stops ticking without snapping, so a failed stage leaves progress
    /// short of its ceiling.
    pub fn cancel(self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_never_decrease() {
        let p = Progress::new();
        let mut last = 0;
        p.set_floor(10);
        for _ in 0..30 {
            p.advance_towards(20);
            let v = p.snapshot();
            assert!(v >= last);
            last = v;
        }
        p.set_floor(5);
        assert!(p.snapshot() >= last);
    }

    #[test]
    fn test_advance_stays_below_ceiling_until_completion() {
        let p = Progress::new();
        p.set_floor(10);
        for _ in 0..50 {
            p.advance_towards(20);
        }
        assert_eq!(p.snapshot(), 19);
        p.complete_stage(20);
        assert_eq!(p.snapshot(), 20);
    }

    #[test]
    fn test_value_is_capped_at_100() {
        let p = Progress::new();
        p.set_floor(250);
        assert_eq!(p.snapshot(), 100);
    }

    #[test]
    fn test_ticker_complete_snaps_to_ceiling() {
        let p = Progress::new();
        p.set_floor(30);
        let ticker = ProgressTicker::start(p.clone(), 40, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(20));
        ticker.complete();
        assert_eq!(p.snapshot(), 40);
    }

    #[test]
    fn test_ticker_cancel_leaves_value_short_of_ceiling() {
        let p = Progress::new();
        p.set_floor(30);
        let ticker = ProgressTicker::start(p.clone(), 40, Duration::from_millis(1));
        std::thread::sleep(Duration::from_millis(5));
        ticker.cancel();
        assert!(p.snapshot() < 40);
    }
}
