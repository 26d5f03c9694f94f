//! Countdown state machine and the feed-event-to-time-credit mapping.

use shared::domain::{TimerSnapshot, TimerState, TimerUpdate};
use storage::Storage;
use tracing::{info, warn};

pub mod translator;

pub use translator::{translate, Translation};

const MILLIS_PER_SECOND: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPhase {
    /// Nothing left on the clock.
    Idle,
    /// Time remains but the countdown is stopped.
    Armed,
    Running,
}

/// Authoritative countdown. Every mutation is written to storage before the
/// resulting [`TimerUpdate`] is handed back for fan-out.
pub struct TimerEngine {
    state: TimerState,
    carry_millis: u16,
    storage: Storage,
}

impl TimerEngine {
    /// Loads the persisted snapshot. A restart never resumes a countdown: the
    /// stored `isRunning` flag is always discarded.
    pub fn load(storage: Storage) -> Self {
        let now = now_ms();
        let (state, carry_millis) = match storage.load_timer() {
            Ok(Some(snapshot)) => {
                info!(
                    remaining_seconds = snapshot.state.remaining_seconds,
                    total_seconds = snapshot.state.total_seconds,
                    was_running = snapshot.state.is_running,
                    "restored timer snapshot"
                );
                (
                    TimerState {
                        is_running: false,
                        last_updated: now,
                        ..snapshot.state
                    },
                    snapshot.carry_millis.min(999),
                )
            }
            Ok(None) => (TimerState::idle(now), 0),
            Err(error) => {
                warn!(%error, "failed to load timer snapshot; starting from zero");
                (TimerState::idle(now), 0)
            }
        };
        Self {
            state,
            carry_millis,
            storage,
        }
    }

    pub fn state(&self) -> TimerState {
        self.state
    }

    pub fn carry_millis(&self) -> u16 {
        self.carry_millis
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running
    }

    pub fn phase(&self) -> TimerPhase {
        if self.state.is_running {
            TimerPhase::Running
        } else if self.state.remaining_seconds > 0 {
            TimerPhase::Armed
        } else {
            TimerPhase::Idle
        }
    }

    pub fn set_time(&mut self, seconds: u64) -> TimerUpdate {
        self.state.total_seconds = seconds;
        self.state.remaining_seconds = seconds;
        self.state.is_running = false;
        self.carry_millis = 0;
        self.commit()
    }

    /// Credits `delta` seconds to the remaining time only. Deltas are rounded
    /// to the millisecond; whole seconds land in `remaining_seconds` and the
    /// rest is carried into the next call. Draining the timer to zero stops
    /// a running countdown.
    pub fn add_time(&mut self, delta: f64) -> TimerUpdate {
        if !delta.is_finite() {
            warn!(delta, "ignoring non-finite time delta");
            return self.commit();
        }
        let delta_millis = (delta * MILLIS_PER_SECOND as f64).round() as i64;
        let pending = i64::from(self.carry_millis).saturating_add(delta_millis);
        let whole = pending.div_euclid(MILLIS_PER_SECOND);
        let carry = pending.rem_euclid(MILLIS_PER_SECOND);

        let remaining = i64::try_from(self.state.remaining_seconds)
            .unwrap_or(i64::MAX)
            .saturating_add(whole);
        if remaining <= 0 {
            self.state.remaining_seconds = 0;
            self.state.is_running = false;
            self.carry_millis = if remaining == 0 { carry as u16 } else { 0 };
        } else {
            self.state.remaining_seconds = remaining as u64;
            self.carry_millis = carry as u16;
        }
        self.commit()
    }

    /// Starts the countdown. Returns `None` when already running or when
    /// there is nothing left to count down.
    pub fn start(&mut self) -> Option<TimerUpdate> {
        if self.phase() != TimerPhase::Armed {
            return None;
        }
        self.state.is_running = true;
        Some(self.commit())
    }

    pub fn pause(&mut self) -> TimerUpdate {
        self.state.is_running = false;
        self.commit()
    }

    pub fn reset(&mut self) -> TimerUpdate {
        self.state.remaining_seconds = self.state.total_seconds;
        self.state.is_running = false;
        self.carry_millis = 0;
        self.commit()
    }

    /// One whole-second decrement. Stops the countdown in the same tick that
    /// reaches zero.
    pub fn tick(&mut self) -> Option<TimerUpdate> {
        if !self.is_running() {
            return None;
        }
        self.state.remaining_seconds = self.state.remaining_seconds.saturating_sub(1);
        if self.state.remaining_seconds == 0 {
            self.state.is_running = false;
            info!("countdown reached zero");
        }
        Some(self.commit())
    }

    fn commit(&mut self) -> TimerUpdate {
        self.state.last_updated = now_ms();
        let snapshot = TimerSnapshot {
            state: self.state,
            carry_millis: self.carry_millis,
        };
        if let Err(error) = self.storage.save_timer(&snapshot) {
            warn!(%error, "failed to persist timer snapshot; keeping in-memory state");
        }
        TimerUpdate::from(&self.state)
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
