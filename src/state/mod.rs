/// Typed session events.
pub mod bus;
pub mod clock;
/// Live channel status.
pub mod connection;
pub mod leaderboard;
/// Contest phase machine.
pub mod phase;
pub mod registration;
pub mod timer;

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    dto::{
        channel::InboundMessage,
        contest::{ContestDocument, ProblemSummary},
        leaderboard::{LeaderboardDocument, LeaderboardRow},
    },
    error::ActionError,
    state::{
        bus::{EventBus, SyncEvent},
        clock::{ClockConfidence, ClockSynchronizer, LocalClock},
        connection::{ChannelConnection, ChannelStatus},
        leaderboard::{Leaderboard, LeaderboardMerger, Skipped},
        phase::{ContestPhase, PhaseEvent, PhaseMachine, PhaseSignal, Transition},
        registration::{ActionTicket, Admission, RegistrationSession, SessionAction, SessionTracker},
        timer::{ContestTimers, TimerSnapshot},
    },
};

/// Receivers for the read-only views of a contest session.
///
/// Every view has exactly one writer (the session's event loop); consumers subscribe to
/// changes instead of polling.
#[derive(Clone)]
pub struct ContestViews {
    /// Current phase.
    pub phase: watch::Receiver<ContestPhase>,
    /// Current leaderboard.
    pub leaderboard: watch::Receiver<Arc<Leaderboard>>,
    /// Registration/participation session.
    pub registration: watch::Receiver<RegistrationSession>,
    /// Live channel status.
    pub connection: watch::Receiver<ChannelConnection>,
    /// Countdowns to start and end.
    pub countdown: watch::Receiver<TimerSnapshot>,
    /// Trust in the corrected clock.
    pub clock: watch::Receiver<ClockConfidence>,
}

struct ViewPublisher {
    phase: watch::Sender<ContestPhase>,
    leaderboard: watch::Sender<Arc<Leaderboard>>,
    registration: watch::Sender<RegistrationSession>,
    connection: watch::Sender<ChannelConnection>,
    countdown: watch::Sender<TimerSnapshot>,
    clock: watch::Sender<ClockConfidence>,
}

/// What a batch of phase candidates changed.
#[derive(Debug, Default)]
pub struct PhaseOutcome {
    /// Transitions applied, in order.
    pub transitions: Vec<Transition>,
    /// Action abandoned because the phase moved under it.
    pub cancelled: Option<ActionTicket>,
}

/// Everything the client knows about one contest.
///
/// Owned by a single event loop; every mutation goes through `&mut self` so no locking is
/// involved. Changes are fanned out through the watch views and the [`EventBus`].
pub struct ContestState {
    contest_id: String,
    title: String,
    clock: ClockSynchronizer,
    timers: ContestTimers,
    phase: PhaseMachine,
    leaderboard: LeaderboardMerger,
    registration: SessionTracker,
    problems: Vec<ProblemSummary>,
    confidence: ClockConfidence,
    /// Last phase change came from a server signal; past boundaries must not override it.
    phase_from_server: bool,
    views: ViewPublisher,
    bus: EventBus,
}

impl ContestState {
    /// Build the state from the first contest document.
    ///
    /// The initial phase is the server's when the document carries one, otherwise it is
    /// derived from the boundaries against corrected time.
    pub fn from_document(
        document: ContestDocument,
        received_at: i64,
        clock: Arc<dyn LocalClock>,
        config: &SyncConfig,
    ) -> Self {
        let mut synchronizer = ClockSynchronizer::new(clock, config.smoothing_factor);
        synchronizer.ingest(clock_sample(document.server_time, received_at));

        let now = synchronizer.now().millis;
        let phase_from_server = document.phase.is_some();
        let initial_phase = document
            .phase
            .map(ContestPhase::from)
            .unwrap_or_else(|| ContestPhase::derive(document.start_time, document.end_time, now));
        let mut timers = ContestTimers::new(document.start_time, document.end_time, initial_phase);
        if phase_from_server {
            timers.align_to_server(initial_phase, now);
        }

        let mut registration = SessionTracker::new();
        registration.seed(document.registration.as_ref());

        let mut leaderboard = LeaderboardMerger::new();
        if initial_phase == ContestPhase::Ended {
            leaderboard.freeze();
        }

        let confidence = if synchronizer.is_synchronized() {
            ClockConfidence::Synchronized
        } else {
            ClockConfidence::Unsynchronized
        };
        let (phase_tx, _) = watch::channel(initial_phase);
        let (leaderboard_tx, _) = watch::channel(Arc::new(leaderboard.leaderboard()));
        let (registration_tx, _) = watch::channel(registration.session());
        let (connection_tx, _) = watch::channel(ChannelConnection::closed());
        let (countdown_tx, _) = watch::channel(timers.snapshot());
        let (clock_tx, _) = watch::channel(confidence);

        info!(
            contest_id = %document.id,
            phase = ?initial_phase,
            offset_ms = synchronizer.offset_millis(),
            "contest state initialised"
        );

        Self {
            contest_id: document.id,
            title: document.title,
            clock: synchronizer,
            timers,
            phase: PhaseMachine::new(initial_phase),
            leaderboard,
            registration,
            problems: visible_problems(initial_phase, document.problems),
            confidence,
            phase_from_server,
            views: ViewPublisher {
                phase: phase_tx,
                leaderboard: leaderboard_tx,
                registration: registration_tx,
                connection: connection_tx,
                countdown: countdown_tx,
                clock: clock_tx,
            },
            bus: EventBus::new(config.event_capacity),
        }
    }

    /// Identifier of the contest.
    pub fn contest_id(&self) -> &str {
        &self.contest_id
    }

    /// Title from the latest contest document.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Current phase.
    pub fn phase(&self) -> ContestPhase {
        self.phase.phase()
    }

    /// Problems visible in the current phase.
    pub fn problems(&self) -> &[ProblemSummary] {
        &self.problems
    }

    /// Event bus of the session.
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Subscribe to every read-only view.
    pub fn views(&self) -> ContestViews {
        ContestViews {
            phase: self.views.phase.subscribe(),
            leaderboard: self.views.leaderboard.subscribe(),
            registration: self.views.registration.subscribe(),
            connection: self.views.connection.subscribe(),
            countdown: self.views.countdown.subscribe(),
            clock: self.views.clock.subscribe(),
        }
    }

    /// Fold a server timestamp received at `received_at` (local clock) into the offset.
    pub fn ingest_server_time(&mut self, server_time: i64, received_at: i64) {
        if !self.clock.ingest(clock_sample(server_time, received_at)) {
            warn!(server_time, "ignoring non-positive server time");
        }
    }

    /// Advance the timers and return their fire edges as phase candidates.
    pub fn tick(&mut self) -> Vec<PhaseEvent> {
        let edges = self.timers.tick(self.clock.now());
        self.views.countdown.send_replace(self.timers.snapshot());
        edges.into_iter().map(PhaseEvent::TimerFired).collect()
    }

    /// Resolve contemporaneous phase candidates and apply the consequences.
    pub fn resolve_phase(&mut self, candidates: &[PhaseEvent]) -> PhaseOutcome {
        if candidates.is_empty() {
            return PhaseOutcome::default();
        }

        let resolution = self.phase.resolve(candidates);
        for rejected in &resolution.rejected {
            debug!(error = %rejected, "ignoring timer edge");
        }
        if !resolution.superseded.is_empty() {
            info!(
                superseded = ?resolution.superseded,
                "server phase signal overrides local timer edges"
            );
        }

        let mut outcome = PhaseOutcome::default();
        for transition in &resolution.transitions {
            info!(
                contest_id = %self.contest_id,
                from = ?transition.from,
                to = ?transition.to,
                source = ?transition.source,
                "contest phase changed"
            );
            self.timers.align(transition.to);
            if transition.to == ContestPhase::Ended {
                self.leaderboard.freeze();
            } else if self.leaderboard.is_frozen() {
                self.leaderboard.unfreeze();
            }
            if transition.to == ContestPhase::Upcoming {
                self.problems.clear();
            }
            if let Some(ticket) = self.registration.cancel_in_flight() {
                warn!(
                    action = ticket.action.name(),
                    "phase changed while action in flight; abandoning it"
                );
                outcome.cancelled = Some(ticket);
                self.publish_registration();
            }
            self.bus.publish(SyncEvent::PhaseChanged {
                from: transition.from,
                to: transition.to,
                source: transition.source,
            });
        }

        if let Some(PhaseSignal {
            start_time,
            end_time,
            ..
        }) = resolution.signal
        {
            self.timers.rearm(start_time, end_time);
            self.timers
                .align_to_server(self.phase.phase(), self.clock.now().millis);
            self.phase_from_server = true;
        } else if !resolution.transitions.is_empty() {
            self.phase_from_server = false;
        }

        if let Some(last) = resolution.transitions.last() {
            self.views.phase.send_replace(last.to);
            self.publish_leaderboard();
        }
        self.views.countdown.send_replace(self.timers.snapshot());
        outcome.transitions = resolution.transitions;
        outcome
    }

    /// Apply a push message. Phase signals are returned as candidates for the caller to
    /// resolve together with whatever else arrived in the same turn.
    pub fn apply_message(&mut self, message: InboundMessage, received_at: i64) -> Option<PhaseEvent> {
        self.ingest_server_time(message.server_time(), received_at);
        match message {
            InboundMessage::LeaderboardSnapshot(payload) => {
                self.apply_snapshot(payload.server_time, payload.entries);
                None
            }
            InboundMessage::LeaderboardDelta(payload) => {
                match self
                    .leaderboard
                    .apply_delta(payload.server_time, payload.entries)
                {
                    Ok(()) => self.publish_leaderboard(),
                    Err(Skipped::Frozen) => debug!("leaderboard frozen; delta ignored"),
                    Err(Skipped::Stale) => debug!(
                        server_time = payload.server_time,
                        "delta predates current snapshot; ignored"
                    ),
                }
                None
            }
            InboundMessage::Announcement(payload) => {
                self.bus.publish(SyncEvent::Announcement {
                    id: payload.id,
                    message: payload.message,
                    server_time: payload.server_time,
                });
                None
            }
            InboundMessage::ParticipantCount(payload) => {
                self.bus.publish(SyncEvent::ParticipantCount(payload.count));
                None
            }
            InboundMessage::PhaseSignal(payload) => Some(PhaseEvent::ServerSignal(PhaseSignal {
                phase: payload.phase.into(),
                start_time: payload.start_time,
                end_time: payload.end_time,
            })),
        }
    }

    /// Apply a leaderboard fetched over REST (initial load, resync, final results).
    pub fn apply_leaderboard_document(&mut self, document: LeaderboardDocument, received_at: i64) {
        self.ingest_server_time(document.server_time, received_at);
        self.apply_snapshot(document.server_time, document.entries);
    }

    /// Reconcile a refetched contest document: boundaries, problems and registration.
    ///
    /// The document's own phase is not applied here; after a transition the REST view may
    /// lag behind the live channel.
    pub fn apply_contest_document(&mut self, document: ContestDocument, received_at: i64) {
        self.ingest_server_time(document.server_time, received_at);

        if document.start_time != self.timers.start_time()
            || document.end_time != self.timers.end_time()
        {
            info!(
                start_time = document.start_time,
                end_time = document.end_time,
                "contest boundaries moved; rearming timers"
            );
            self.timers
                .rearm(Some(document.start_time), Some(document.end_time));
            if self.phase_from_server {
                self.timers
                    .align_to_server(self.phase.phase(), self.clock.now().millis);
            } else {
                self.timers.align(self.phase.phase());
            }
        }

        self.title = document.title;
        self.problems = visible_problems(self.phase.phase(), document.problems);
        if self.registration.seed(document.registration.as_ref()) {
            self.publish_registration();
        }
        self.views.countdown.send_replace(self.timers.snapshot());
        self.bus.publish(SyncEvent::ContestRefreshed {
            start_time: document.start_time,
            end_time: document.end_time,
            problems: self.problems.clone(),
        });
    }

    /// Start an action in the current phase.
    pub fn begin_action(&mut self, action: SessionAction) -> Result<Admission, ActionError> {
        let admission = self.registration.begin(action, self.phase.phase())?;
        if matches!(admission, Admission::Issue(_)) {
            self.publish_registration();
        }
        Ok(admission)
    }

    /// Reconcile a successful action. `None` when the ticket was superseded.
    pub fn confirm_action(
        &mut self,
        ticket: ActionTicket,
        confirmed_at: Option<i64>,
    ) -> Option<RegistrationSession> {
        let session = self.registration.confirm(ticket, confirmed_at)?;
        info!(
            action = ticket.action.name(),
            status = ?session.status,
            "action confirmed by server"
        );
        self.publish_registration();
        Some(session)
    }

    /// Reconcile a failed action. `None` when the ticket was superseded.
    pub fn fail_action(
        &mut self,
        ticket: ActionTicket,
        error: &ActionError,
    ) -> Option<RegistrationSession> {
        let session = self.registration.fail(ticket, error)?;
        warn!(error = %error, "action failed");
        self.publish_registration();
        Some(session)
    }

    /// Record a channel connectivity change.
    pub fn set_connection(&mut self, connection: ChannelConnection) {
        let changed = *self.views.connection.borrow() != connection;
        if changed {
            self.views.connection.send_replace(connection.clone());
            self.bus.publish(SyncEvent::ConnectionChanged(connection));
        }
    }

    /// Current live channel status.
    pub fn connection(&self) -> ChannelConnection {
        self.views.connection.borrow().clone()
    }

    /// Re-evaluate clock confidence; staleness only counts while the channel is open.
    pub fn check_clock(&mut self, stale_after: Duration) -> ClockConfidence {
        let mut confidence = self.clock.confidence(stale_after);
        if confidence == ClockConfidence::Stale && self.connection().status != ChannelStatus::Open
        {
            confidence = ClockConfidence::Synchronized;
        }
        if confidence != self.confidence {
            if confidence == ClockConfidence::Stale {
                warn!(
                    contest_id = %self.contest_id,
                    "no server time sample within staleness window; clock may be inaccurate"
                );
            }
            self.confidence = confidence;
            self.views.clock.send_replace(confidence);
            self.bus.publish(SyncEvent::ClockConfidence(confidence));
        }
        confidence
    }

    /// Whether the live channel should be connected right now.
    pub fn channel_wanted(&self, live_window: Duration) -> bool {
        match self.phase.phase() {
            ContestPhase::Live => true,
            ContestPhase::Ended => false,
            ContestPhase::Upcoming => {
                let window = i64::try_from(live_window.as_millis()).unwrap_or(i64::MAX);
                self.timers.start_time().saturating_sub(self.clock.now().millis) <= window
            }
        }
    }

    /// Copy of the current leaderboard.
    pub fn leaderboard(&self) -> Leaderboard {
        self.leaderboard.leaderboard()
    }

    /// Current registration session.
    pub fn registration(&self) -> RegistrationSession {
        self.registration.session()
    }

    /// Current countdowns.
    pub fn countdown(&self) -> TimerSnapshot {
        self.timers.snapshot()
    }

    fn apply_snapshot(&mut self, server_time: i64, rows: Vec<LeaderboardRow>) {
        match self.leaderboard.apply_snapshot(server_time, rows) {
            Ok(()) => self.publish_leaderboard(),
            Err(_) => debug!(server_time, "older leaderboard snapshot ignored"),
        }
    }

    fn publish_leaderboard(&mut self) {
        let board = Arc::new(self.leaderboard.leaderboard());
        self.views.leaderboard.send_replace(board.clone());
        self.bus.publish(SyncEvent::LeaderboardUpdated(board));
    }

    fn publish_registration(&mut self) {
        let session = self.registration.session();
        self.views.registration.send_replace(session.clone());
        self.bus.publish(SyncEvent::RegistrationChanged(session));
    }
}

fn clock_sample(server_time: i64, received_at: i64) -> clock::ServerTimeSample {
    clock::ServerTimeSample {
        server_timestamp: server_time,
        received_at_local: received_at,
    }
}

/// Problems stay hidden until the contest is live.
fn visible_problems(phase: ContestPhase, problems: Vec<ProblemSummary>) -> Vec<ProblemSummary> {
    if phase == ContestPhase::Upcoming {
        Vec::new()
    } else {
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dto::{
            channel::{LeaderboardPayload, PhaseSignalPayload},
            phase::WirePhase,
        },
        state::{clock::ManualClock, timer::Boundary},
    };

    const T: i64 = 1_700_000_000_000;

    fn document(start: i64, end: i64, server_time: i64) -> ContestDocument {
        ContestDocument {
            id: "42".into(),
            title: "Round 42".into(),
            start_time: start,
            end_time: end,
            server_time,
            phase: None,
            registration: None,
            problems: vec![ProblemSummary {
                id: "A".into(),
                title: "Warmup".into(),
            }],
        }
    }

    fn state_at(clock: &ManualClock, doc: ContestDocument) -> ContestState {
        let received_at = clock.now_millis();
        ContestState::from_document(
            doc,
            received_at,
            Arc::new(clock.clone()),
            &SyncConfig::default(),
        )
    }

    #[test]
    fn initial_phase_uses_corrected_time() {
        // Local clock is 5s fast; raw local time is already past the start.
        let clock = ManualClock::new(T + 3_000);
        let state = state_at(&clock, document(T, T + 60_000, T - 2_000));
        assert_eq!(state.phase(), ContestPhase::Upcoming);
        assert!(state.problems().is_empty());
    }

    #[test]
    fn timer_edge_moves_to_live_and_cancels_pending_register() {
        let clock = ManualClock::new(T - 1_000);
        let mut state = state_at(&clock, document(T, T + 60_000, T - 1_000));
        let mut phase_rx = state.views().phase;
        let Admission::Issue(ticket) = state.begin_action(SessionAction::Register).unwrap() else {
            panic!("register should issue a request");
        };

        clock.advance(1_000);
        let candidates = state.tick();
        assert_eq!(candidates, vec![PhaseEvent::TimerFired(Boundary::Start)]);
        let outcome = state.resolve_phase(&candidates);
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.cancelled, Some(ticket));
        assert!(phase_rx.has_changed().unwrap());
        assert_eq!(*phase_rx.borrow_and_update(), ContestPhase::Live);
        assert_eq!(
            state.registration().status,
            registration::RegistrationStatus::None
        );
    }

    #[test]
    fn phase_signal_rearms_timers() {
        let clock = ManualClock::new(T - 1_000);
        let mut state = state_at(&clock, document(T, T + 60_000, T - 1_000));

        let candidate = state.apply_message(
            InboundMessage::PhaseSignal(PhaseSignalPayload {
                server_time: T - 900,
                phase: WirePhase::Upcoming,
                start_time: Some(T + 30_000),
                end_time: Some(T + 90_000),
            }),
            clock.now_millis(),
        );
        let outcome = state.resolve_phase(&[candidate.unwrap()]);
        assert!(outcome.transitions.is_empty());
        assert_eq!(state.countdown().start.target_instant, T + 30_000);

        clock.advance(2_000);
        assert!(state.tick().is_empty());
        assert_eq!(state.phase(), ContestPhase::Upcoming);
    }

    fn upcoming_signal(server_time: i64, start_time: Option<i64>) -> InboundMessage {
        InboundMessage::PhaseSignal(PhaseSignalPayload {
            server_time,
            phase: WirePhase::Upcoming,
            start_time,
            end_time: None,
        })
    }

    #[test]
    fn postponement_is_not_undone_by_a_past_start() {
        let clock = ManualClock::new(T + 5_000);
        let mut state = state_at(&clock, document(T, T + 60_000, T + 5_000));
        assert_eq!(state.phase(), ContestPhase::Live);

        let candidate = state.apply_message(upcoming_signal(T + 5_000, None), clock.now_millis());
        state.resolve_phase(&[candidate.unwrap()]);
        assert_eq!(state.phase(), ContestPhase::Upcoming);

        for _ in 0..3 {
            clock.advance(1_000);
            let candidates = state.tick();
            assert!(candidates.is_empty());
            assert!(state.resolve_phase(&candidates).transitions.is_empty());
            // Repeated signals (as the polling fallback sends them) do not flap.
            let again = state.apply_message(upcoming_signal(clock.now_millis(), None), clock.now_millis());
            assert!(state.resolve_phase(&[again.unwrap()]).transitions.is_empty());
        }

        // A refetch carrying the same boundaries keeps the hold.
        state.apply_contest_document(document(T, T + 60_000, clock.now_millis()), clock.now_millis());
        assert!(state.tick().is_empty());
        assert_eq!(state.phase(), ContestPhase::Upcoming);

        // A future start from the server arms the timer again.
        let candidate = state.apply_message(
            upcoming_signal(clock.now_millis(), Some(T + 30_000)),
            clock.now_millis(),
        );
        state.resolve_phase(&[candidate.unwrap()]);
        clock.set(T + 30_000);
        let candidates = state.tick();
        assert_eq!(candidates, vec![PhaseEvent::TimerFired(Boundary::Start)]);
        state.resolve_phase(&candidates);
        assert_eq!(state.phase(), ContestPhase::Live);
    }

    #[test]
    fn non_positive_server_time_leaves_the_clock_alone() {
        let clock = ManualClock::new(T);
        let mut state = state_at(&clock, document(T + 60_000, T + 120_000, T));
        let before = state.countdown().start.target_instant;

        state.apply_leaderboard_document(
            LeaderboardDocument {
                server_time: -1,
                entries: Vec::new(),
            },
            clock.now_millis(),
        );
        let mut doc = document(T + 60_000, T + 120_000, i64::MIN);
        doc.title = "Renamed".into();
        state.apply_contest_document(doc, clock.now_millis());

        assert_eq!(state.countdown().start.target_instant, before);
        assert!(state.tick().is_empty());
        assert_eq!(state.countdown().start.remaining_millis, 60_000);
    }

    #[test]
    fn ended_freezes_leaderboard() {
        let clock = ManualClock::new(T + 10_000);
        let mut state = state_at(&clock, document(T, T + 20_000, T + 10_000));
        assert_eq!(state.phase(), ContestPhase::Live);
        state.apply_message(
            InboundMessage::LeaderboardSnapshot(LeaderboardPayload {
                server_time: T + 10_001,
                entries: vec![LeaderboardRow::new("A", 1, 10)],
            }),
            clock.now_millis(),
        );

        clock.advance(10_000);
        let candidates = state.tick();
        state.resolve_phase(&candidates);
        assert_eq!(state.phase(), ContestPhase::Ended);

        state.apply_message(
            InboundMessage::LeaderboardDelta(LeaderboardPayload {
                server_time: T + 20_500,
                entries: vec![LeaderboardRow::new("A", 5, 10)],
            }),
            clock.now_millis(),
        );
        let board = state.leaderboard();
        assert!(board.frozen);
        assert_eq!(board.entry("A").unwrap().problems_solved, 1);
    }

    #[test]
    fn channel_opens_near_start() {
        let clock = ManualClock::new(T - 3_600_000);
        let state = state_at(&clock, document(T, T + 60_000, T - 3_600_000));
        assert!(!state.channel_wanted(Duration::from_secs(600)));
        clock.set(T - 300_000);
        assert!(state.channel_wanted(Duration::from_secs(600)));
    }

    #[test]
    fn stale_clock_only_reported_while_connected() {
        let clock = ManualClock::new(T);
        let mut state = state_at(&clock, document(T + 1_000_000, T + 2_000_000, T));
        clock.advance(120_000);
        assert_eq!(
            state.check_clock(Duration::from_secs(60)),
            ClockConfidence::Synchronized
        );

        state.set_connection(ChannelConnection {
            status: ChannelStatus::Open,
            retry_count: 0,
            last_error: None,
        });
        assert_eq!(
            state.check_clock(Duration::from_secs(60)),
            ClockConfidence::Stale
        );
        state.ingest_server_time(T + 120_000, clock.now_millis());
        assert_eq!(
            state.check_clock(Duration::from_secs(60)),
            ClockConfidence::Synchronized
        );
    }
}
