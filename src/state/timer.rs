//! Countdown timers for the contest start and end boundaries.
//!
//! Timers never decrement a local counter: every tick recomputes the remaining time from the
//! clock synchronizer, so an offset correction shows up on the next tick.

use crate::state::{clock::CorrectedTime, phase::ContestPhase};

/// Which contest boundary a timer watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Boundary {
    /// Contest start (`Upcoming -> Live`).
    Start,
    /// Contest end (`Live -> Ended`).
    End,
}

/// Observable state of one timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    /// Boundary instant, server time.
    pub target_instant: i64,
    /// Corrected time at the last tick.
    pub corrected_now: i64,
    /// Time left until the target, clamped to zero once fired.
    pub remaining_millis: i64,
    /// Whether the boundary has been passed.
    pub has_fired: bool,
}

/// Timer watching a single boundary. Reports its fire edge exactly once per arming.
#[derive(Debug, Clone)]
pub struct Countdown {
    boundary: Boundary,
    state: TimerState,
}

impl Countdown {
    /// Arm a timer for `target_instant`.
    pub fn watch(boundary: Boundary, target_instant: i64) -> Self {
        Self {
            boundary,
            state: TimerState {
                target_instant,
                corrected_now: 0,
                remaining_millis: 0,
                has_fired: false,
            },
        }
    }

    /// Recompute the remaining time; returns `true` only on the tick that crosses the target.
    ///
    /// While the clock is unsynchronized the countdown is updated but never fires.
    pub fn tick(&mut self, now: CorrectedTime) -> bool {
        self.state.corrected_now = now.millis;
        if self.state.has_fired {
            return false;
        }

        self.state.remaining_millis = self.state.target_instant.saturating_sub(now.millis);
        if !now.synchronized || self.state.remaining_millis > 0 {
            return false;
        }

        self.state.has_fired = true;
        self.state.remaining_millis = 0;
        true
    }

    /// Point the timer at a new target and clear the fired latch.
    pub fn rearm(&mut self, target_instant: i64) {
        self.state.target_instant = target_instant;
        self.state.has_fired = false;
    }

    /// Mark the boundary as already passed without reporting an edge.
    pub fn latch(&mut self) {
        self.state.has_fired = true;
        self.state.remaining_millis = 0;
    }

    /// Clear the latch while keeping the target.
    fn reset(&mut self) {
        self.state.has_fired = false;
    }

    /// Watched boundary.
    pub fn boundary(&self) -> Boundary {
        self.boundary
    }

    /// State as of the last tick.
    pub fn state(&self) -> TimerState {
        self.state
    }
}

/// Snapshot of both boundary timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerSnapshot {
    /// Countdown to the start.
    pub start: TimerState,
    /// Countdown to the end.
    pub end: TimerState,
}

/// The pair of timers a contest needs.
#[derive(Debug, Clone)]
pub struct ContestTimers {
    start: Countdown,
    end: Countdown,
}

impl ContestTimers {
    /// Arm both timers and latch the ones `phase` has already passed.
    pub fn new(start_time: i64, end_time: i64, phase: ContestPhase) -> Self {
        let mut timers = Self {
            start: Countdown::watch(Boundary::Start, start_time),
            end: Countdown::watch(Boundary::End, end_time),
        };
        timers.align(phase);
        timers
    }

    /// Advance both timers; fire edges are returned start first.
    pub fn tick(&mut self, now: CorrectedTime) -> Vec<Boundary> {
        let mut fired = Vec::new();
        for timer in [&mut self.start, &mut self.end] {
            if timer.tick(now) {
                fired.push(timer.boundary());
            }
        }
        fired
    }

    /// Re-target timers whose boundary moved. Unchanged boundaries keep their latch.
    pub fn rearm(&mut self, start_time: Option<i64>, end_time: Option<i64>) {
        if let Some(start) = start_time.filter(|start| *start != self.start.state.target_instant) {
            self.start.rearm(start);
        }
        if let Some(end) = end_time.filter(|end| *end != self.end.state.target_instant) {
            self.end.rearm(end);
        }
    }

    /// Make the latches agree with `phase`: boundaries behind the phase are latched, the ones
    /// ahead of it are armed.
    pub fn align(&mut self, phase: ContestPhase) {
        match phase {
            ContestPhase::Upcoming => {
                self.start.reset();
                self.end.reset();
            }
            ContestPhase::Live => {
                self.start.latch();
                self.end.reset();
            }
            ContestPhase::Ended => {
                self.start.latch();
                self.end.latch();
            }
        }
    }

    /// Align to a phase the server announced. A boundary the phase has not passed but whose
    /// target is already behind `now` stays latched until it is moved into the future.
    pub fn align_to_server(&mut self, phase: ContestPhase, now: i64) {
        self.align(phase);
        for timer in [&mut self.start, &mut self.end] {
            if !timer.state.has_fired && timer.state.target_instant <= now {
                timer.latch();
            }
        }
    }

    /// Armed start boundary.
    pub fn start_time(&self) -> i64 {
        self.start.state.target_instant
    }

    /// Armed end boundary.
    pub fn end_time(&self) -> i64 {
        self.end.state.target_instant
    }

    /// Both timers' current state.
    pub fn snapshot(&self) -> TimerSnapshot {
        TimerSnapshot {
            start: self.start.state(),
            end: self.end.state(),
        }
    }
}

/// Render a remaining duration as `HH:MM:SS`, prefixed with whole days when there are any.
pub fn format_remaining(remaining_millis: i64) -> String {
    let total_seconds = remaining_millis.max(0) / 1_000;
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;
    if days > 0 {
        format!("{days}d {hours:02}:{minutes:02}:{seconds:02}")
    } else {
        format!("{hours:02}:{minutes:02}:{seconds:02}")
    }
}
