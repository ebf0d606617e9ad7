//! Per-contest event loop.
//!
//! [`ContestSync`] is the handle; the driver task behind it is the only writer of the contest
//! state. Timer ticks, channel events, REST completions and user actions are all funnelled
//! through one `select!` loop, so no component ever observes a half-applied update.

use std::{future::pending, sync::Arc};

use futures::Stream;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    dto::{
        contest::{ActionResponse, ContestDocument},
        leaderboard::LeaderboardDocument,
    },
    error::{ActionError, ActionFailure, ApiError, ApiResult, ChannelError},
    services::{
        contest_api::ContestApi,
        push_channel::{
            ChannelEvent, ChannelHandle, ChannelManager, ChannelSettings, transport::PushTransport,
        },
    },
    state::{
        ContestState, ContestViews, PhaseOutcome,
        bus::{EventBus, SyncEvent},
        clock::LocalClock,
        connection::ChannelConnection,
        phase::{ContestPhase, PhaseEvent},
        registration::{ActionTicket, Admission, RegistrationSession, SessionAction},
    },
};

const COMMAND_BUFFER: usize = 32;
const CHANNEL_BUFFER: usize = 256;

/// Reasons the server gives when the action already took effect on an earlier attempt.
const ALREADY_DONE_REASONS: [&str; 2] = ["already_registered", "already_participating"];

type ActionReply = oneshot::Sender<Result<RegistrationSession, ActionError>>;

enum Command {
    Act {
        action: SessionAction,
        reply: ActionReply,
    },
    Reconnect,
    Shutdown,
}

enum Internal {
    ActionDone {
        ticket: ActionTicket,
        result: ApiResult<ActionResponse>,
        received_at: i64,
    },
    Refreshed {
        contest: ApiResult<ContestDocument>,
        leaderboard: ApiResult<LeaderboardDocument>,
        received_at: i64,
    },
}

struct PendingAction {
    ticket: ActionTicket,
    waiters: Vec<ActionReply>,
    task: JoinHandle<()>,
}

/// Handle on a running contest session.
///
/// Dropping the handle stops the session once the driver notices the closed command channel.
pub struct ContestSync {
    contest_id: String,
    title: String,
    commands: mpsc::Sender<Command>,
    views: ContestViews,
    bus: EventBus,
    task: JoinHandle<()>,
}

impl ContestSync {
    /// Load the contest and start its driver task.
    ///
    /// Fails only when the contest document itself cannot be fetched; everything after that
    /// is recovered internally.
    pub async fn start(
        config: SyncConfig,
        contest_id: impl Into<String>,
        api: Arc<dyn ContestApi>,
        transport: Arc<dyn PushTransport>,
        clock: Arc<dyn LocalClock>,
    ) -> ApiResult<Self> {
        let contest_id = contest_id.into();
        let document = api.fetch_contest(&contest_id).await?;
        let received_at = clock.now_millis();
        let mut state = ContestState::from_document(document, received_at, clock.clone(), &config);

        match api.fetch_leaderboard(&contest_id).await {
            Ok(board) => {
                let received_at = clock.now_millis();
                state.apply_leaderboard_document(board, received_at);
            }
            Err(err) => warn!(error = %err, "initial leaderboard fetch failed"),
        }

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let views = state.views();
        let bus = state.bus().clone();
        let title = state.title().to_owned();

        let driver = Driver {
            config,
            contest_id: contest_id.clone(),
            state,
            api,
            transport,
            clock,
            commands: commands_rx,
            internal_tx,
            internal_rx,
            channel: None,
            channel_rx: None,
            channel_gave_up: false,
            pending: None,
        };
        let task = tokio::spawn(driver.run());

        Ok(Self {
            contest_id,
            title,
            commands: commands_tx,
            views,
            bus,
            task,
        })
    }

    /// Identifier of the followed contest.
    pub fn contest_id(&self) -> &str {
        &self.contest_id
    }

    /// Title from the first contest document.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Read-only views of phase, leaderboard, registration, connection, countdown and clock.
    pub fn views(&self) -> ContestViews {
        self.views.clone()
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe()
    }

    /// Session events as a stream; ends when the session stops.
    pub fn stream(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        self.bus.stream()
    }

    /// Register for the contest. Only valid while `Upcoming`.
    ///
    /// Calling again while a registration is in flight waits for the same request; calling
    /// after it succeeded returns the current session without contacting the server.
    pub async fn register(&self) -> Result<RegistrationSession, ActionError> {
        self.act(SessionAction::Register).await
    }

    /// Join the running contest. Only valid while `Live`.
    pub async fn join(&self) -> Result<RegistrationSession, ActionError> {
        self.act(SessionAction::Join).await
    }

    /// Re-open the live channel after it gave up.
    pub async fn reconnect(&self) {
        let _ = self.commands.send(Command::Reconnect).await;
    }

    /// Stop the session and wait for the driver to wind down.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown).await;
        let _ = self.task.await;
    }

    async fn act(&self, action: SessionAction) -> Result<RegistrationSession, ActionError> {
        let closed = || {
            ActionError::new(
                action.name(),
                ActionFailure::SessionClosed,
                "contest session is no longer running",
            )
        };
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(Command::Act { action, reply })
            .await
            .map_err(|_| closed())?;
        outcome.await.map_err(|_| closed())?
    }
}

struct Driver {
    config: SyncConfig,
    contest_id: String,
    state: ContestState,
    api: Arc<dyn ContestApi>,
    transport: Arc<dyn PushTransport>,
    clock: Arc<dyn LocalClock>,
    commands: mpsc::Receiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    channel: Option<ChannelHandle>,
    channel_rx: Option<mpsc::Receiver<ChannelEvent>>,
    /// Set when the channel exhausted its retries; cleared by an explicit reconnect.
    channel_gave_up: bool,
    pending: Option<PendingAction>,
}

impl Driver {
    async fn run(mut self) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.update_channel();

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Act { action, reply }) => self.begin_action(action, reply),
                    Some(Command::Reconnect) => {
                        info!(contest_id = %self.contest_id, "live channel reconnect requested");
                        self.channel_gave_up = false;
                        self.update_channel();
                    }
                    Some(Command::Shutdown) | None => break,
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                event = next_channel_event(&mut self.channel_rx) => match event {
                    Some(event) => {
                        let mut candidates = Vec::new();
                        self.handle_channel_event(event, &mut candidates);
                        self.drain_channel(&mut candidates);
                        self.resolve(&candidates);
                    }
                    None => {
                        self.channel = None;
                        self.channel_rx = None;
                    }
                },
                _ = ticker.tick() => self.tick(),
            }
        }

        self.stop().await;
    }

    fn tick(&mut self) {
        let mut candidates = self.state.tick();
        self.drain_channel(&mut candidates);
        self.resolve(&candidates);
        self.state.check_clock(self.config.clock_stale_after);
        self.update_channel();
    }

    /// Pull whatever the channel already queued so it is resolved in the same turn.
    fn drain_channel(&mut self, candidates: &mut Vec<PhaseEvent>) {
        while let Some(event) = self.channel_rx.as_mut().and_then(|rx| rx.try_recv().ok()) {
            self.handle_channel_event(event, candidates);
        }
    }

    fn handle_channel_event(&mut self, event: ChannelEvent, candidates: &mut Vec<PhaseEvent>) {
        match event {
            ChannelEvent::Status(connection) => self.state.set_connection(connection),
            ChannelEvent::Resynced {
                document,
                received_at,
            } => {
                debug!(
                    server_time = document.server_time,
                    entries = document.entries.len(),
                    "leaderboard resynchronised"
                );
                self.state.apply_leaderboard_document(document, received_at);
            }
            ChannelEvent::Message {
                message,
                received_at,
            } => {
                if let Some(candidate) = self.state.apply_message(message, received_at) {
                    candidates.push(candidate);
                }
            }
            ChannelEvent::Terminated(error) => {
                if matches!(error, ChannelError::RetriesExhausted { .. }) {
                    warn!(
                        contest_id = %self.contest_id,
                        error = %error,
                        "live channel gave up; waiting for an explicit reconnect"
                    );
                    self.channel_gave_up = true;
                }
                self.state.bus().publish(SyncEvent::ChannelTerminated(error));
                self.channel = None;
                self.channel_rx = None;
            }
        }
    }

    fn resolve(&mut self, candidates: &[PhaseEvent]) {
        let PhaseOutcome {
            transitions,
            cancelled,
        } = self.state.resolve_phase(candidates);

        if let Some(ticket) = cancelled {
            self.cancel_action(ticket);
        }
        if transitions.is_empty() {
            return;
        }
        self.refresh();
        if self.state.phase() == ContestPhase::Ended {
            self.close_channel(Some(ChannelError::ContestEnded));
        }
        self.update_channel();
    }

    /// Open or close the channel according to the phase and distance to the start.
    fn update_channel(&mut self) {
        let wanted = self.state.channel_wanted(self.config.live_window);
        match (wanted, self.channel.is_some()) {
            (true, false) if !self.channel_gave_up => self.open_channel(),
            (false, true) => self.close_channel(None),
            _ => {}
        }
    }

    fn open_channel(&mut self) {
        info!(
            contest_id = %self.contest_id,
            transport = self.transport.name(),
            "opening live channel"
        );
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER);
        let manager = ChannelManager::new(
            self.contest_id.clone(),
            self.transport.clone(),
            self.api.clone(),
            self.clock.clone(),
            ChannelSettings::from(&self.config),
            tx,
        );
        self.channel = Some(manager.spawn());
        self.channel_rx = Some(rx);
    }

    /// Tear the channel down, keeping whatever terminal notice it already queued.
    fn close_channel(&mut self, reason: Option<ChannelError>) {
        let Some(handle) = self.channel.take() else {
            return;
        };
        drop(handle);

        let mut terminated = false;
        if let Some(mut rx) = self.channel_rx.take() {
            while let Ok(event) = rx.try_recv() {
                if let ChannelEvent::Terminated(error) = event {
                    self.state.bus().publish(SyncEvent::ChannelTerminated(error));
                    terminated = true;
                }
            }
        }
        match reason {
            Some(reason) if !terminated => {
                self.state.bus().publish(SyncEvent::ChannelTerminated(reason));
            }
            _ => {}
        }
        self.state.set_connection(ChannelConnection::closed());
        info!(contest_id = %self.contest_id, "live channel closed");
    }

    fn begin_action(&mut self, action: SessionAction, reply: ActionReply) {
        match self.state.begin_action(action) {
            Err(err) => {
                debug!(error = %err, "action refused locally");
                let _ = reply.send(Err(err));
            }
            Ok(Admission::AlreadyDone(session)) => {
                let _ = reply.send(Ok(session));
            }
            Ok(Admission::InFlight(ticket)) => match self.pending.as_mut() {
                Some(pending) if pending.ticket == ticket => pending.waiters.push(reply),
                _ => {
                    let _ = reply.send(Err(ActionError::new(
                        action.name(),
                        ActionFailure::Cancelled,
                        "request is no longer tracked",
                    )));
                }
            },
            Ok(Admission::Issue(ticket)) => {
                info!(contest_id = %self.contest_id, action = action.name(), "sending action");
                let request = match action {
                    SessionAction::Register => self.api.register(&self.contest_id),
                    SessionAction::Join => self.api.join(&self.contest_id),
                };
                let clock = self.clock.clone();
                let internal = self.internal_tx.clone();
                let task = tokio::spawn(async move {
                    let result = request.await;
                    let received_at = clock.now_millis();
                    let _ = internal.send(Internal::ActionDone {
                        ticket,
                        result,
                        received_at,
                    });
                });
                self.pending = Some(PendingAction {
                    ticket,
                    waiters: vec![reply],
                    task,
                });
            }
        }
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::ActionDone {
                ticket,
                result,
                received_at,
            } => self.finish_action(ticket, result, received_at),
            Internal::Refreshed {
                contest,
                leaderboard,
                received_at,
            } => {
                match contest {
                    Ok(document) => self.state.apply_contest_document(document, received_at),
                    Err(err) => warn!(error = %err, "contest refresh failed"),
                }
                match leaderboard {
                    Ok(document) => self.state.apply_leaderboard_document(document, received_at),
                    Err(err) => warn!(error = %err, "leaderboard refresh failed"),
                }
                self.update_channel();
            }
        }
    }

    fn finish_action(
        &mut self,
        ticket: ActionTicket,
        result: ApiResult<ActionResponse>,
        received_at: i64,
    ) {
        let Some(pending) = self.pending.take_if(|pending| pending.ticket == ticket) else {
            debug!(action = ticket.action.name(), "discarding result of abandoned action");
            return;
        };
        let action = ticket.action.name();

        let outcome = match result {
            Ok(response) => {
                self.state
                    .ingest_server_time(response.server_time, received_at);
                let confirmed_at = response.confirmed_at.or(Some(response.server_time));
                self.state
                    .confirm_action(ticket, confirmed_at)
                    .ok_or_else(|| abandoned(action))
            }
            Err(err) if already_done(&err) => {
                info!(action, "server reports action already applied");
                self.state
                    .confirm_action(ticket, None)
                    .ok_or_else(|| abandoned(action))
            }
            Err(err) => {
                let error = ActionError::from_api(action, &err);
                self.state.fail_action(ticket, &error);
                Err(error)
            }
        };

        for waiter in pending.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    fn cancel_action(&mut self, ticket: ActionTicket) {
        let Some(pending) = self.pending.take_if(|pending| pending.ticket == ticket) else {
            return;
        };
        pending.task.abort();
        let error = abandoned(ticket.action.name());
        for waiter in pending.waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// Refetch the contest and the leaderboard after a phase transition.
    fn refresh(&self) {
        let api = self.api.clone();
        let clock = self.clock.clone();
        let internal = self.internal_tx.clone();
        let contest_id = self.contest_id.clone();
        tokio::spawn(async move {
            let (contest, leaderboard) = tokio::join!(
                api.fetch_contest(&contest_id),
                api.fetch_leaderboard(&contest_id)
            );
            let received_at = clock.now_millis();
            let _ = internal.send(Internal::Refreshed {
                contest,
                leaderboard,
                received_at,
            });
        });
    }

    async fn stop(mut self) {
        if let Some(pending) = self.pending.take() {
            pending.task.abort();
        }
        if let Some(handle) = self.channel.take() {
            handle.disconnect().await;
        }
        info!(contest_id = %self.contest_id, "contest session stopped");
    }
}

async fn next_channel_event(rx: &mut Option<mpsc::Receiver<ChannelEvent>>) -> Option<ChannelEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

fn abandoned(action: &'static str) -> ActionError {
    ActionError::new(
        action,
        ActionFailure::Cancelled,
        "contest phase changed while the request was in flight",
    )
}

fn already_done(err: &ApiError) -> bool {
    matches!(err, ApiError::Rejected { reason, .. } if ALREADY_DONE_REASONS.contains(&reason.as_str()))
}
