//! Registration and participation bookkeeping.
//!
//! Actions go through an explicit `Pending` state: `begin` flips the status optimistically and
//! hands out a ticket, the REST outcome is then reconciled through `confirm` or `fail`. Results
//! carrying a ticket that is no longer in flight (superseded by a phase change) are discarded.

use uuid::Uuid;

use crate::{
    dto::contest::{RecordStatus, RegistrationRecord},
    error::{ActionError, ActionFailure},
    state::phase::ContestPhase,
};

/// Status exposed to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not registered.
    None,
    /// A register/join request is in flight.
    Pending,
    /// Registration confirmed by the server.
    Registered,
    /// Participation confirmed by the server.
    Participating,
    /// The server declined the last action.
    Failed,
}

/// Read-only view of the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationSession {
    /// Current status.
    pub status: RegistrationStatus,
    /// When the server confirmed the status.
    pub server_confirmed_at: Option<i64>,
    /// Reason of the last authoritative rejection, cleared by the next success.
    pub last_failure: Option<ActionFailure>,
}

impl Default for RegistrationSession {
    fn default() -> Self {
        Self {
            status: RegistrationStatus::None,
            server_confirmed_at: None,
            last_failure: None,
        }
    }
}

/// User-triggered mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionAction {
    /// Register before the start.
    Register,
    /// Join the running contest.
    Join,
}

impl SessionAction {
    /// Name used in logs and errors.
    pub fn name(self) -> &'static str {
        match self {
            SessionAction::Register => "register",
            SessionAction::Join => "join",
        }
    }

    fn required_phase(self) -> ContestPhase {
        match self {
            SessionAction::Register => ContestPhase::Upcoming,
            SessionAction::Join => ContestPhase::Live,
        }
    }

    fn target(self) -> RegistrationStatus {
        match self {
            SessionAction::Register => RegistrationStatus::Registered,
            SessionAction::Join => RegistrationStatus::Participating,
        }
    }
}

/// Handle for one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionTicket {
    /// Unique id of this attempt.
    pub id: Uuid,
    /// Action the request performs.
    pub action: SessionAction,
}

/// Result of asking to start an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Send the request; the status is now `Pending`.
    Issue(ActionTicket),
    /// The same action is already in flight; wait for its outcome.
    InFlight(ActionTicket),
    /// The target status already holds; nothing to send.
    AlreadyDone(RegistrationSession),
}

#[derive(Debug, Clone)]
struct InFlight {
    ticket: ActionTicket,
    previous: RegistrationSession,
}

/// Single writer of [`RegistrationSession`].
#[derive(Debug, Default)]
pub struct SessionTracker {
    session: RegistrationSession,
    in_flight: Option<InFlight>,
}

impl SessionTracker {
    /// Tracker with no registration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current session.
    pub fn session(&self) -> RegistrationSession {
        self.session.clone()
    }

    /// Ticket currently awaiting a server answer.
    pub fn in_flight(&self) -> Option<ActionTicket> {
        self.in_flight.as_ref().map(|pending| pending.ticket)
    }

    /// Decide whether `action` should issue a request in `phase`.
    pub fn begin(
        &mut self,
        action: SessionAction,
        phase: ContestPhase,
    ) -> Result<Admission, ActionError> {
        if let Some(pending) = &self.in_flight {
            if pending.ticket.action == action {
                return Ok(Admission::InFlight(pending.ticket));
            }
            return Err(ActionError::new(
                action.name(),
                ActionFailure::WrongPhase,
                format!("{} is still in flight", pending.ticket.action.name()),
            ));
        }

        if phase != action.required_phase() {
            return Err(ActionError::new(
                action.name(),
                ActionFailure::WrongPhase,
                format!("not available while the contest is {phase:?}"),
            ));
        }

        let done = match action {
            SessionAction::Register => matches!(
                self.session.status,
                RegistrationStatus::Registered | RegistrationStatus::Participating
            ),
            SessionAction::Join => self.session.status == RegistrationStatus::Participating,
        };
        if done {
            return Ok(Admission::AlreadyDone(self.session.clone()));
        }

        let ticket = ActionTicket {
            id: Uuid::new_v4(),
            action,
        };
        self.in_flight = Some(InFlight {
            ticket,
            previous: self.session.clone(),
        });
        self.session.status = RegistrationStatus::Pending;
        Ok(Admission::Issue(ticket))
    }

    /// Apply a server confirmation. Returns `None` when the ticket is no longer in flight.
    pub fn confirm(
        &mut self,
        ticket: ActionTicket,
        confirmed_at: Option<i64>,
    ) -> Option<RegistrationSession> {
        self.take_if_current(ticket)?;
        self.session = RegistrationSession {
            status: ticket.action.target(),
            server_confirmed_at: confirmed_at,
            last_failure: None,
        };
        Some(self.session.clone())
    }

    /// Apply a failure. Rejections land in `Failed`; retryable failures restore the previous
    /// status. Returns `None` when the ticket is no longer in flight.
    pub fn fail(
        &mut self,
        ticket: ActionTicket,
        error: &ActionError,
    ) -> Option<RegistrationSession> {
        let pending = self.take_if_current(ticket)?;
        self.session = match &error.failure {
            ActionFailure::Rejected { .. } => RegistrationSession {
                status: RegistrationStatus::Failed,
                server_confirmed_at: pending.previous.server_confirmed_at,
                last_failure: Some(error.failure.clone()),
            },
            _ => pending.previous,
        };
        Some(self.session.clone())
    }

    /// Abandon whatever is in flight because the phase changed underneath it.
    pub fn cancel_in_flight(&mut self) -> Option<ActionTicket> {
        let pending = self.in_flight.take()?;
        self.session = pending.previous;
        Some(pending.ticket)
    }

    /// Reconcile with the registration record of a contest document. Only upgrades the status
    /// and never touches a pending action.
    pub fn seed(&mut self, record: Option<&RegistrationRecord>) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        let Some(record) = record else {
            return false;
        };
        let status = match record.status {
            RecordStatus::Registered => RegistrationStatus::Registered,
            RecordStatus::Participating => RegistrationStatus::Participating,
        };
        let upgrade = match (self.session.status, status) {
            (RegistrationStatus::Participating, _) => false,
            (RegistrationStatus::Registered, RegistrationStatus::Registered) => false,
            _ => true,
        };
        if upgrade {
            self.session = RegistrationSession {
                status,
                server_confirmed_at: record.confirmed_at,
                last_failure: None,
            };
        }
        upgrade
    }

    fn take_if_current(&mut self, ticket: ActionTicket) -> Option<InFlight> {
        let current = self
            .in_flight
            .as_ref()
            .is_some_and(|pending| pending.ticket.id == ticket.id);
        if current { self.in_flight.take() } else { None }
    }
}
