//! In-memory doubles for the REST API and the live transport.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, future::BoxFuture};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{
    dto::{
        channel::InboundMessage,
        contest::{ActionResponse, ContestDocument, ProblemSummary, RecordStatus},
        leaderboard::{LeaderboardDocument, LeaderboardRow},
    },
    error::{ApiError, ApiResult, TransportError},
    services::{
        contest_api::ContestApi,
        push_channel::transport::{MessageStream, PushTransport},
    },
    state::clock::{LocalClock, ManualClock},
};

pub(crate) fn contest_doc(id: &str, start: i64, end: i64, server_time: i64) -> ContestDocument {
    ContestDocument {
        id: id.into(),
        title: format!("Contest {id}"),
        start_time: start,
        end_time: end,
        server_time,
        phase: None,
        registration: None,
        problems: vec![ProblemSummary {
            id: "A".into(),
            title: "Two sums".into(),
        }],
    }
}

/// What the fake answers to `register`/`join`.
#[derive(Debug, Clone)]
pub(crate) enum ActionOutcome {
    Confirm,
    Reject(&'static str),
    Unavailable,
}

struct Inner {
    contest: Mutex<ContestDocument>,
    leaderboard: Mutex<LeaderboardDocument>,
    leaderboard_delay: Mutex<Option<Duration>>,
    outcome: Mutex<ActionOutcome>,
    gate: watch::Sender<bool>,
    server_clock: Mutex<Option<ManualClock>>,
    contest_fetches: AtomicUsize,
    leaderboard_fetches: AtomicUsize,
    register_calls: AtomicUsize,
    join_calls: AtomicUsize,
}

impl Inner {
    fn server_time(&self, stored: i64) -> i64 {
        self.server_clock
            .lock()
            .unwrap()
            .as_ref()
            .map_or(stored, LocalClock::now_millis)
    }
}

#[derive(Clone)]
pub(crate) struct FakeApi {
    inner: Arc<Inner>,
}

impl FakeApi {
    pub(crate) fn new(contest: ContestDocument) -> Self {
        let leaderboard = LeaderboardDocument {
            server_time: contest.server_time,
            entries: Vec::new(),
        };
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(Inner {
                contest: Mutex::new(contest),
                leaderboard: Mutex::new(leaderboard),
                leaderboard_delay: Mutex::new(None),
                outcome: Mutex::new(ActionOutcome::Confirm),
                gate,
                server_clock: Mutex::new(None),
                contest_fetches: AtomicUsize::new(0),
                leaderboard_fetches: AtomicUsize::new(0),
                register_calls: AtomicUsize::new(0),
                join_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Stamp every response with `clock`'s current time instead of the stored `serverTime`.
    pub(crate) fn follow_clock(&self, clock: &ManualClock) {
        *self.inner.server_clock.lock().unwrap() = Some(clock.clone());
    }

    pub(crate) fn update_contest(&self, update: impl FnOnce(&mut ContestDocument)) {
        update(&mut self.inner.contest.lock().unwrap());
    }

    pub(crate) fn set_leaderboard(&self, server_time: i64, entries: Vec<LeaderboardRow>) {
        *self.inner.leaderboard.lock().unwrap() = LeaderboardDocument {
            server_time,
            entries,
        };
    }

    pub(crate) fn delay_leaderboard(&self, delay: Duration) {
        *self.inner.leaderboard_delay.lock().unwrap() = Some(delay);
    }

    pub(crate) fn set_action_outcome(&self, outcome: ActionOutcome) {
        *self.inner.outcome.lock().unwrap() = outcome;
    }

    /// Park every action request until [`FakeApi::release_actions`].
    pub(crate) fn hold_actions(&self) {
        self.inner.gate.send_replace(false);
    }

    pub(crate) fn release_actions(&self) {
        self.inner.gate.send_replace(true);
    }

    pub(crate) fn contest_fetches(&self) -> usize {
        self.inner.contest_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn leaderboard_fetches(&self) -> usize {
        self.inner.leaderboard_fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn register_calls(&self) -> usize {
        self.inner.register_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn join_calls(&self) -> usize {
        self.inner.join_calls.load(Ordering::SeqCst)
    }

    fn action(&self, path: String, status: RecordStatus) -> BoxFuture<'static, ApiResult<ActionResponse>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut gate = inner.gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;

            let server_time = inner.server_time(inner.contest.lock().unwrap().server_time);
            let outcome = inner.outcome.lock().unwrap().clone();
            match outcome {
                ActionOutcome::Confirm => Ok(ActionResponse {
                    server_time,
                    status,
                    confirmed_at: Some(server_time),
                }),
                ActionOutcome::Reject(reason) => Err(ApiError::Rejected {
                    path,
                    status: 409,
                    reason: reason.into(),
                    message: format!("{reason} (test)"),
                }),
                ActionOutcome::Unavailable => Err(ApiError::RequestStatus { path, status: 503 }),
            }
        })
    }
}

impl ContestApi for FakeApi {
    fn fetch_contest(&self, _contest_id: &str) -> BoxFuture<'static, ApiResult<ContestDocument>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.contest_fetches.fetch_add(1, Ordering::SeqCst);
            let mut document = inner.contest.lock().unwrap().clone();
            document.server_time = inner.server_time(document.server_time);
            Ok(document)
        })
    }

    fn fetch_leaderboard(
        &self,
        _contest_id: &str,
    ) -> BoxFuture<'static, ApiResult<LeaderboardDocument>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.leaderboard_fetches.fetch_add(1, Ordering::SeqCst);
            let delay = *inner.leaderboard_delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut document = inner.leaderboard.lock().unwrap().clone();
            document.server_time = inner.server_time(document.server_time);
            Ok(document)
        })
    }

    fn register(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ActionResponse>> {
        self.inner.register_calls.fetch_add(1, Ordering::SeqCst);
        self.action(
            format!("contests/{contest_id}/register"),
            RecordStatus::Registered,
        )
    }

    fn join(&self, contest_id: &str) -> BoxFuture<'static, ApiResult<ActionResponse>> {
        self.inner.join_calls.fetch_add(1, Ordering::SeqCst);
        self.action(
            format!("contests/{contest_id}/join"),
            RecordStatus::Participating,
        )
    }
}

enum Scripted {
    Refuse(String),
    Accept(mpsc::UnboundedReceiver<Result<String, TransportError>>),
}

/// Transport whose connection attempts follow a script; unscripted attempts are refused.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    attempts: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse(&self, reason: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(Scripted::Refuse(reason.into()));
    }

    /// Accept the next attempt; frames pushed into the feed are delivered on that connection.
    pub(crate) fn accept(&self) -> FrameFeed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().unwrap().push_back(Scripted::Accept(rx));
        FrameFeed { tx }
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PushTransport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn connect(&self, _contest_id: &str) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        Box::pin(async move {
            match next {
                Some(Scripted::Accept(rx)) => Ok(UnboundedReceiverStream::new(rx).boxed()),
                Some(Scripted::Refuse(reason)) => Err(TransportError::Connect(reason)),
                None => Err(TransportError::Connect("connection refused".into())),
            }
        })
    }
}

/// Server side of a scripted connection. Dropping it closes the connection.
pub(crate) struct FrameFeed {
    tx: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl FrameFeed {
    pub(crate) fn send(&self, message: &InboundMessage) {
        let text = message.to_json_string().unwrap();
        let _ = self.tx.send(Ok(text));
    }

    pub(crate) fn send_raw(&self, text: &str) {
        let _ = self.tx.send(Ok(text.into()));
    }

    pub(crate) fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(TransportError::Receive(reason.into())));
    }
}
