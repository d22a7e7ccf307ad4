//! Time source and delayed-callback scheduling.
//!
//! Everything the scheduler knows about time comes through [`Clock`]:
//!
//! - [`TokioClock`]: production clock. Each timer is a sleeping tokio task
//!   that is aborted on cancel.
//! - [`ManualClock`]: virtual clock for tests and replays. Time only moves
//!   when [`ManualClock::advance`] is called, and due timers fire in deadline
//!   order on the caller's thread.
//!
//! Wall-clock timestamps ([`Clock::wall_now`]) are derived from the same
//! timeline as [`Clock::now`], so a notice issued after a virtual 180 s
//! advance is stamped 180 s later.
//!
//! Cancelling a [`TimerHandle`] is best effort. A timer that is already
//! running when it is cancelled still runs to completion, so callers must be
//! able to recognise a late firing on their own (the scheduler does this with
//! generation stamps).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// Work scheduled to run once a delay elapses.
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// Abstraction over wall-clock time and delayed execution.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current instant (monotonic).
    fn now(&self) -> Instant;

    /// Current wall-clock time, on the same timeline as [`Clock::now`].
    fn wall_now(&self) -> DateTime<Utc>;

    /// Run `task` once `delay` has elapsed, on the clock's own execution context.
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Cancellation handle for a scheduled timer.
///
/// Dropping the handle does **not** cancel the timer; call [`TimerHandle::cancel`].
pub struct TimerHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl TimerHandle {
    /// Wrap a cancellation action.
    #[must_use]
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A handle whose cancellation does nothing.
    #[must_use]
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Cancel the timer if it has not fired yet.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("cancellable", &self.cancel.is_some())
            .finish()
    }
}

/// Errors constructing a clock.
#[derive(Debug, Error)]
pub enum ClockError {
    /// `TokioClock::current` was called outside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(#[from] tokio::runtime::TryCurrentError),
}

/// `origin` moved forward by `elapsed`, saturating at chrono's range.
fn wall_offset(origin: DateTime<Utc>, elapsed: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(elapsed)
        .ok()
        .and_then(|delta| origin.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

// ── Tokio clock ─────────────────────────────────────────────────────────────

/// Production clock backed by the tokio timer wheel.
///
/// `now()` reads `tokio::time::Instant`, so tests running with paused time
/// (`#[tokio::test(start_paused = true)]`) see virtual time here too.
#[derive(Debug, Clone)]
pub struct TokioClock {
    handle: tokio::runtime::Handle,
    origin: tokio::time::Instant,
    wall_origin: DateTime<Utc>,
}

impl TokioClock {
    /// Bind to the runtime of the calling context.
    pub fn current() -> Result<Self, ClockError> {
        Ok(Self::with_handle(tokio::runtime::Handle::try_current()?))
    }

    /// Bind to an explicit runtime handle.
    #[must_use]
    pub fn with_handle(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle,
            origin: tokio::time::Instant::now(),
            wall_origin: Utc::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn wall_now(&self) -> DateTime<Utc> {
        wall_offset(self.wall_origin, self.origin.elapsed())
    }

    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        let abort = join.abort_handle();
        TimerHandle::new(move || abort.abort())
    }
}

// ── Manual clock ────────────────────────────────────────────────────────────

type TimerKey = (Duration, u64);

struct ManualState {
    anchor: Instant,
    wall_anchor: DateTime<Utc>,
    elapsed: Duration,
    next_id: u64,
    pending: BTreeMap<TimerKey, TimerTask>,
}

impl fmt::Debug for ManualState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualState")
            .field("wall_anchor", &self.wall_anchor)
            .field("elapsed", &self.elapsed)
            .field("next_id", &self.next_id)
            .field("pending", &self.pending.len())
            .finish()
    }
}

/// Virtual clock for deterministic testing.
///
/// Cloning shares the same timeline.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Create a clock anchored at the current instant with no elapsed time.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a clock whose wall time starts at `wall_anchor`.
    #[must_use]
    pub fn starting_at(wall_anchor: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                anchor: Instant::now(),
                wall_anchor,
                elapsed: Duration::ZERO,
                next_id: 0,
                pending: BTreeMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    /// Number of timers scheduled and not yet fired or cancelled.
    #[must_use]
    pub fn pending_timers(&self) -> usize {
        self.lock().pending.len()
    }

    /// Time until the earliest pending timer is due.
    #[must_use]
    pub fn next_due_in(&self) -> Option<Duration> {
        let state = self.lock();
        state
            .pending
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_sub(state.elapsed))
    }

    /// Move time forward by `by`, firing every timer that falls due on the way.
    ///
    /// Timers run on the calling thread, in deadline order (creation order for
    /// equal deadlines), with the clock lock released. A timer scheduled while
    /// advancing fires in the same call if its deadline is within range.
    /// Returns the number of timers fired.
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.lock().elapsed.saturating_add(by);
        let mut fired = 0;

        loop {
            let task = {
                let mut state = self.lock();
                let due = state
                    .pending
                    .keys()
                    .next()
                    .copied()
                    .filter(|(deadline, _)| *deadline <= target);
                match due {
                    Some(key) => {
                        state.elapsed = state.elapsed.max(key.0);
                        state.pending.remove(&key)
                    }
                    None => {
                        // another thread may already have advanced further
                        state.elapsed = state.elapsed.max(target);
                        None
                    }
                }
            };

            match task {
                Some(task) => {
                    task();
                    fired += 1;
                }
                None => break,
            }
        }

        fired
    }

    /// Jump straight to the earliest pending timer and fire everything due then.
    ///
    /// Returns `false` when nothing is scheduled.
    pub fn advance_to_next(&self) -> bool {
        match self.next_due_in() {
            Some(delta) => {
                self.advance(delta);
                true
            }
            None => false,
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let state = self.lock();
        state.anchor + state.elapsed
    }

    fn wall_now(&self) -> DateTime<Utc> {
        let state = self.lock();
        wall_offset(state.wall_anchor, state.elapsed)
    }

    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let key = (state.elapsed.saturating_add(delay), id);
        state.pending.insert(key, task);
        drop(state);

        let weak = Arc::downgrade(&self.inner);
        TimerHandle::new(move || {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.lock().unwrap_or_else(|e| e.into_inner());
                state.pending.remove(&key);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> TimerTask) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_for_tasks = Arc::clone(&log);
        let make = move |label: &'static str| -> TimerTask {
            let log = Arc::clone(&log_for_tasks);
            Box::new(move || log.lock().unwrap().push(label))
        };
        (log, make)
    }

    #[test]
    fn manual_clock_fires_in_deadline_order() {
        let clock = ManualClock::new();
        let (log, task) = recorder();

        let _b = clock.after(Duration::from_secs(20), task("b"));
        let _a = clock.after(Duration::from_secs(10), task("a"));
        let _c = clock.after(Duration::from_secs(20), task("c"));

        assert_eq!(clock.advance(Duration::from_secs(9)), 0);
        assert_eq!(clock.advance(Duration::from_secs(11)), 3);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn manual_clock_now_tracks_elapsed() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now() - start, Duration::from_millis(1500));
    }

    #[test]
    fn manual_wall_time_follows_virtual_time() {
        let start = DateTime::parse_from_rfc3339("2026-01-05T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let clock = ManualClock::starting_at(start);
        assert_eq!(clock.wall_now(), start);

        clock.advance(Duration::from_secs(180));
        assert_eq!(clock.wall_now() - start, TimeDelta::seconds(180));
    }

    #[test]
    fn wall_offset_saturates() {
        let start = Utc::now();
        assert_eq!(wall_offset(start, Duration::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let clock = ManualClock::new();
        let (log, task) = recorder();

        let handle = clock.after(Duration::from_secs(1), task("cancelled"));
        let _kept = clock.after(Duration::from_secs(2), task("kept"));
        handle.cancel();

        assert_eq!(clock.pending_timers(), 1);
        clock.advance(Duration::from_secs(5));
        assert_eq!(*log.lock().unwrap(), vec!["kept"]);
    }

    #[test]
    fn timers_scheduled_while_advancing_fire_in_range() {
        let clock = ManualClock::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner_clock = clock.clone();
        let inner_hits = Arc::clone(&hits);
        let _outer = clock.after(
            Duration::from_secs(1),
            Box::new(move || {
                inner_hits.fetch_add(1, Ordering::SeqCst);
                let hits = Arc::clone(&inner_hits);
                let _ = inner_clock.after(
                    Duration::from_secs(1),
                    Box::new(move || {
                        hits.fetch_add(10, Ordering::SeqCst);
                    }),
                );
            }),
        );

        assert_eq!(clock.advance(Duration::from_secs(2)), 2);
        assert_eq!(hits.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn advance_to_next_jumps_exactly_to_deadline() {
        let clock = ManualClock::new();
        let (_log, task) = recorder();
        let _t = clock.after(Duration::from_secs(180), task("t"));

        assert_eq!(clock.next_due_in(), Some(Duration::from_secs(180)));
        assert!(clock.advance_to_next());
        assert_eq!(clock.elapsed(), Duration::from_secs(180));
        assert!(!clock.advance_to_next());
    }

    #[test]
    fn detached_handle_cancel_is_noop() {
        TimerHandle::detached().cancel();
    }
}
