use thiserror::Error;

use crate::state::timer::Boundary;

/// Lifecycle phase of a contest.
///
/// The derived ordering (`Upcoming < Live < Ended`) is the order timer-driven transitions
/// must respect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContestPhase {
    /// Registration is open; problems are hidden.
    Upcoming,
    /// The contest is running; problems are visible and participants may join.
    Live,
    /// The contest is over; the leaderboard is frozen.
    Ended,
}

impl ContestPhase {
    /// Phase implied by the boundaries at `now`.
    pub fn derive(start_time: i64, end_time: i64, now: i64) -> Self {
        if now >= end_time {
            ContestPhase::Ended
        } else if now >= start_time {
            ContestPhase::Live
        } else {
            ContestPhase::Upcoming
        }
    }
}

/// Authoritative phase change pushed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseSignal {
    /// Phase the server says the contest is in.
    pub phase: ContestPhase,
    /// Corrected start boundary, if it moved.
    pub start_time: Option<i64>,
    /// Corrected end boundary, if it moved.
    pub end_time: Option<i64>,
}

/// Transition candidates fed to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// A countdown crossed its boundary.
    TimerFired(Boundary),
    /// The server pushed a phase signal.
    ServerSignal(PhaseSignal),
}

/// Error returned when a candidate does not apply to the current phase.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event:?} cannot be applied while in {from:?}")]
pub struct InvalidTransition {
    /// The phase the state machine was in when the event was received.
    pub from: ContestPhase,
    /// The event that cannot be applied from this phase.
    pub event: PhaseEvent,
}

/// What caused a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionSource {
    /// A local timer edge.
    Timer(Boundary),
    /// A server phase signal.
    Server,
}

/// A phase change that has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// Phase before the change.
    pub from: ContestPhase,
    /// Phase after the change.
    pub to: ContestPhase,
    /// Timer edge or server signal.
    pub source: TransitionSource,
    /// Version after the transition.
    pub version: usize,
}

/// Outcome of resolving a batch of contemporaneous candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// Transitions applied, in order.
    pub transitions: Vec<Transition>,
    /// Server signal that won the batch; its boundaries must be used to rearm timers.
    pub signal: Option<PhaseSignal>,
    /// Timer edges discarded because a server signal was present.
    pub superseded: Vec<Boundary>,
    /// Timer edges that did not apply to the phase they were checked against.
    pub rejected: Vec<InvalidTransition>,
}

/// Snapshot of the current state machine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase.
    pub phase: ContestPhase,
    /// Increments on each transition.
    pub version: usize,
}

/// Sole authority on the displayed contest phase.
#[derive(Debug, Clone)]
pub struct PhaseMachine {
    phase: ContestPhase,
    version: usize,
}

impl PhaseMachine {
    /// Start in `phase` (derived from the first contest document).
    pub fn new(phase: ContestPhase) -> Self {
        Self { phase, version: 0 }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> ContestPhase {
        self.phase
    }

    /// Create a snapshot of the current state machine state.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
        }
    }

    /// Apply a single candidate. A server signal naming the current phase is accepted but
    /// produces no transition.
    pub fn apply(&mut self, event: PhaseEvent) -> Result<Option<Transition>, InvalidTransition> {
        let next = self.compute_transition(event)?;
        if next == self.phase {
            return Ok(None);
        }

        let source = match event {
            PhaseEvent::TimerFired(boundary) => TransitionSource::Timer(boundary),
            PhaseEvent::ServerSignal(_) => TransitionSource::Server,
        };
        let transition = Transition {
            from: self.phase,
            to: next,
            source,
            version: self.version + 1,
        };
        self.phase = next;
        self.version = transition.version;
        Ok(Some(transition))
    }

    /// Resolve candidates that arrived together.
    ///
    /// A server signal always wins: when one is present every timer edge of the batch is
    /// discarded and only the latest signal is applied. Otherwise timer edges apply in order.
    pub fn resolve(&mut self, candidates: &[PhaseEvent]) -> Resolution {
        let mut resolution = Resolution::default();

        let latest_signal = candidates.iter().rev().find_map(|event| match event {
            PhaseEvent::ServerSignal(signal) => Some(*signal),
            PhaseEvent::TimerFired(_) => None,
        });

        if let Some(signal) = latest_signal {
            resolution.superseded = candidates
                .iter()
                .filter_map(|event| match event {
                    PhaseEvent::TimerFired(boundary) => Some(*boundary),
                    PhaseEvent::ServerSignal(_) => None,
                })
                .collect();
            if let Ok(Some(transition)) = self.apply(PhaseEvent::ServerSignal(signal)) {
                resolution.transitions.push(transition);
            }
            resolution.signal = Some(signal);
            return resolution;
        }

        for event in candidates {
            match self.apply(*event) {
                Ok(Some(transition)) => resolution.transitions.push(transition),
                Ok(None) => {}
                Err(invalid) => resolution.rejected.push(invalid),
            }
        }
        resolution
    }

    /// Compute a transition from an event if the transition is valid.
    fn compute_transition(&self, event: PhaseEvent) -> Result<ContestPhase, InvalidTransition> {
        let next = match (self.phase, event) {
            (_, PhaseEvent::ServerSignal(signal)) => signal.phase,
            (ContestPhase::Upcoming, PhaseEvent::TimerFired(Boundary::Start)) => {
                ContestPhase::Live
            }
            (ContestPhase::Live, PhaseEvent::TimerFired(Boundary::End)) => ContestPhase::Ended,
            (from, event) => return Err(InvalidTransition { from, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(phase: ContestPhase) -> PhaseEvent {
        PhaseEvent::ServerSignal(PhaseSignal {
            phase,
            start_time: None,
            end_time: None,
        })
    }

    #[test]
    fn derives_phase_from_boundaries() {
        assert_eq!(ContestPhase::derive(10, 20, 5), ContestPhase::Upcoming);
        assert_eq!(ContestPhase::derive(10, 20, 10), ContestPhase::Live);
        assert_eq!(ContestPhase::derive(10, 20, 20), ContestPhase::Ended);
    }

    #[test]
    fn timer_edges_walk_the_happy_path() {
        let mut sm = PhaseMachine::new(ContestPhase::Upcoming);
        let live = sm
            .apply(PhaseEvent::TimerFired(Boundary::Start))
            .unwrap()
            .unwrap();
        assert_eq!(live.to, ContestPhase::Live);
        assert_eq!(live.source, TransitionSource::Timer(Boundary::Start));
        let ended = sm
            .apply(PhaseEvent::TimerFired(Boundary::End))
            .unwrap()
            .unwrap();
        assert_eq!(ended.to, ContestPhase::Ended);
        assert_eq!(sm.snapshot().version, 2);
    }

    #[test]
    fn timer_edges_never_move_backwards() {
        let mut sm = PhaseMachine::new(ContestPhase::Ended);
        let err = sm
            .apply(PhaseEvent::TimerFired(Boundary::Start))
            .unwrap_err();
        assert_eq!(err.from, ContestPhase::Ended);
        assert_eq!(sm.phase(), ContestPhase::Ended);

        let mut sm = PhaseMachine::new(ContestPhase::Upcoming);
        assert!(sm.apply(PhaseEvent::TimerFired(Boundary::End)).is_err());
    }

    #[test]
    fn observed_phases_are_monotonic_under_timers() {
        let mut sm = PhaseMachine::new(ContestPhase::Upcoming);
        let edges = [
            Boundary::End,
            Boundary::Start,
            Boundary::Start,
            Boundary::End,
            Boundary::Start,
        ];
        let mut observed = vec![sm.phase()];
        for edge in edges {
            let _ = sm.apply(PhaseEvent::TimerFired(edge));
            observed.push(sm.phase());
        }
        assert!(observed.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(sm.phase(), ContestPhase::Ended);
    }

    #[test]
    fn server_signal_can_move_backwards() {
        let mut sm = PhaseMachine::new(ContestPhase::Live);
        let transition = sm.apply(signal(ContestPhase::Upcoming)).unwrap().unwrap();
        assert_eq!(transition.from, ContestPhase::Live);
        assert_eq!(transition.to, ContestPhase::Upcoming);
        assert_eq!(transition.source, TransitionSource::Server);
    }

    #[test]
    fn server_signal_for_current_phase_is_not_a_transition() {
        let mut sm = PhaseMachine::new(ContestPhase::Live);
        assert_eq!(sm.apply(signal(ContestPhase::Live)).unwrap(), None);
        assert_eq!(sm.snapshot().version, 0);
    }

    #[test]
    fn server_signal_wins_over_contemporaneous_timer_edge() {
        let mut sm = PhaseMachine::new(ContestPhase::Upcoming);
        // Timer says the contest started, the server says it was postponed.
        let postponed = PhaseSignal {
            phase: ContestPhase::Upcoming,
            start_time: Some(5_000),
            end_time: None,
        };
        let resolution = sm.resolve(&[
            PhaseEvent::TimerFired(Boundary::Start),
            PhaseEvent::ServerSignal(postponed),
        ]);
        assert!(resolution.transitions.is_empty());
        assert_eq!(resolution.signal, Some(postponed));
        assert_eq!(resolution.superseded, vec![Boundary::Start]);
        assert_eq!(sm.phase(), ContestPhase::Upcoming);
    }

    #[test]
    fn resolution_order_does_not_depend_on_arrival_order() {
        let forced_end = signal(ContestPhase::Ended);
        let timer = PhaseEvent::TimerFired(Boundary::Start);

        let mut first = PhaseMachine::new(ContestPhase::Upcoming);
        let mut second = PhaseMachine::new(ContestPhase::Upcoming);
        first.resolve(&[timer, forced_end]);
        second.resolve(&[forced_end, timer]);
        assert_eq!(first.phase(), ContestPhase::Ended);
        assert_eq!(second.phase(), ContestPhase::Ended);
    }

    #[test]
    fn timer_only_batch_applies_in_order() {
        let mut sm = PhaseMachine::new(ContestPhase::Upcoming);
        let resolution = sm.resolve(&[
            PhaseEvent::TimerFired(Boundary::Start),
            PhaseEvent::TimerFired(Boundary::End),
        ]);
        let phases: Vec<_> = resolution.transitions.iter().map(|t| t.to).collect();
        assert_eq!(phases, vec![ContestPhase::Live, ContestPhase::Ended]);
        assert!(resolution.rejected.is_empty());
    }
}
