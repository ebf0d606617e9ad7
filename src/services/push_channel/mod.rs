//! Live channel management.
//!
//! A [`ChannelManager`] owns one logical connection per contest: it connects through a
//! [`PushTransport`], performs the resync handshake (fresh leaderboard snapshot + server time
//! sample) before any streamed message is forwarded, and reconnects with jittered exponential
//! backoff until the retry budget is spent or the server announces the end of the contest.

/// Reconnect delay schedule.
pub mod backoff;
pub mod transport;

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    dto::{channel::InboundMessage, leaderboard::LeaderboardDocument, phase::WirePhase},
    error::{ChannelError, TransportError},
    services::contest_api::ContestApi,
    state::{
        clock::LocalClock,
        connection::{ChannelConnection, ChannelStatus},
    },
};

use self::{backoff::Backoff, transport::PushTransport};

/// Everything a channel reports to its owner, in delivery order.
#[derive(Debug)]
pub enum ChannelEvent {
    /// Connectivity changed.
    Status(ChannelConnection),
    /// Resync handshake completed; always precedes the streamed messages of a connection.
    Resynced {
        /// Leaderboard fetched for the handshake.
        document: LeaderboardDocument,
        /// Local clock reading when the fetch completed.
        received_at: i64,
    },
    /// A validated push message with its local receive time.
    Message {
        /// The parsed message.
        message: InboundMessage,
        /// Local clock reading when the frame arrived.
        received_at: i64,
    },
    /// The channel closed for good.
    Terminated(ChannelError),
}

/// Reconnection and resync limits.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// First reconnect delay.
    pub backoff_initial: Duration,
    /// Upper bound on the reconnect delay.
    pub backoff_max: Duration,
    /// Consecutive failed attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Deadline for the resync fetch.
    pub resync_timeout: Duration,
    /// Malformed frames tolerated on one connection.
    pub malformed_message_threshold: u32,
}

impl From<&SyncConfig> for ChannelSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
            max_reconnect_attempts: config.max_reconnect_attempts.max(1),
            resync_timeout: config.resync_timeout,
            malformed_message_threshold: config.malformed_message_threshold.max(1),
        }
    }
}

/// Handle on a running channel task. Dropping it aborts the task.
pub struct ChannelHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Ask the channel to close and wait until it did.
    pub async fn disconnect(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.task).await;
    }

    /// Whether the channel task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

enum SessionEnd {
    /// Owner asked to stop or stopped listening.
    Shutdown,
    /// Server said the contest is over.
    ContestEnded,
    /// Attempt failed before or during the handshake, or the connection misbehaved.
    Failed(TransportError),
    /// An open connection went away.
    Lost(TransportError),
}

/// Connects, resyncs and reconnects the live channel of one contest.
pub struct ChannelManager {
    contest_id: String,
    transport: Arc<dyn PushTransport>,
    api: Arc<dyn ContestApi>,
    clock: Arc<dyn LocalClock>,
    settings: ChannelSettings,
    events: mpsc::Sender<ChannelEvent>,
}

impl ChannelManager {
    /// Prepare a manager; nothing runs until [`ChannelManager::spawn`].
    pub fn new(
        contest_id: impl Into<String>,
        transport: Arc<dyn PushTransport>,
        api: Arc<dyn ContestApi>,
        clock: Arc<dyn LocalClock>,
        settings: ChannelSettings,
        events: mpsc::Sender<ChannelEvent>,
    ) -> Self {
        Self {
            contest_id: contest_id.into(),
            transport,
            api,
            clock,
            settings,
            events,
        }
    }

    /// Start the channel task.
    pub fn spawn(self) -> ChannelHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(self.run(shutdown_rx));
        ChannelHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        let mut backoff = Backoff::new(self.settings.backoff_initial, self.settings.backoff_max);
        let mut failures: u32 = 0;
        let mut last_error: Option<String> = None;

        if !self
            .emit(ChannelEvent::Status(connection(
                ChannelStatus::Connecting,
                0,
                None,
            )))
            .await
        {
            return;
        }

        loop {
            let end = tokio::select! {
                _ = &mut shutdown => SessionEnd::Shutdown,
                end = self.session() => end,
            };

            let error = match end {
                SessionEnd::Shutdown => {
                    debug!(contest_id = %self.contest_id, "live channel shut down");
                    self.emit(ChannelEvent::Status(connection(
                        ChannelStatus::Closed,
                        failures,
                        last_error,
                    )))
                    .await;
                    return;
                }
                SessionEnd::ContestEnded => {
                    info!(contest_id = %self.contest_id, "contest ended; closing live channel");
                    self.terminate(ChannelError::ContestEnded, 0, None).await;
                    return;
                }
                SessionEnd::Lost(error) => {
                    warn!(
                        contest_id = %self.contest_id,
                        error = %error,
                        "live channel lost; reconnecting"
                    );
                    failures = 0;
                    backoff.reset();
                    error
                }
                SessionEnd::Failed(error) => {
                    failures += 1;
                    if failures >= self.settings.max_reconnect_attempts {
                        warn!(
                            contest_id = %self.contest_id,
                            attempts = failures,
                            error = %error,
                            "exhausted live channel reconnect attempts"
                        );
                        let last_error = error.to_string();
                        self.terminate(
                            ChannelError::RetriesExhausted {
                                attempts: failures,
                                last_error: last_error.clone(),
                            },
                            failures,
                            Some(last_error),
                        )
                        .await;
                        return;
                    }
                    warn!(
                        contest_id = %self.contest_id,
                        attempt = failures,
                        error = %error,
                        "live channel attempt failed"
                    );
                    error
                }
            };

            last_error = Some(error.to_string());
            if !self
                .emit(ChannelEvent::Status(connection(
                    ChannelStatus::Reconnecting,
                    failures,
                    last_error.clone(),
                )))
                .await
            {
                return;
            }

            let delay = backoff.next_delay();
            debug!(
                contest_id = %self.contest_id,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "waiting before reconnect"
            );
            tokio::select! {
                _ = &mut shutdown => {
                    self.emit(ChannelEvent::Status(connection(
                        ChannelStatus::Closed,
                        failures,
                        last_error,
                    )))
                    .await;
                    return;
                }
                _ = sleep(delay) => {}
            }
        }
    }

    /// One connection from attempt to loss.
    async fn session(&self) -> SessionEnd {
        let mut frames = match self.transport.connect(&self.contest_id).await {
            Ok(frames) => frames,
            Err(err) => return SessionEnd::Failed(err),
        };

        let document = match timeout(
            self.settings.resync_timeout,
            self.api.fetch_leaderboard(&self.contest_id),
        )
        .await
        {
            Ok(Ok(document)) => document,
            Ok(Err(err)) => return SessionEnd::Failed(TransportError::Resync(err)),
            Err(_) => return SessionEnd::Failed(TransportError::ResyncTimeout),
        };
        let received_at = self.clock.now_millis();
        if !self
            .emit(ChannelEvent::Resynced {
                document,
                received_at,
            })
            .await
        {
            return SessionEnd::Shutdown;
        }
        if !self
            .emit(ChannelEvent::Status(connection(ChannelStatus::Open, 0, None)))
            .await
        {
            return SessionEnd::Shutdown;
        }
        info!(
            contest_id = %self.contest_id,
            transport = self.transport.name(),
            "live channel open"
        );

        let mut malformed: u32 = 0;
        loop {
            let text = match frames.next().await {
                Some(Ok(text)) => text,
                Some(Err(err)) => return SessionEnd::Lost(err),
                None => {
                    return SessionEnd::Lost(TransportError::Receive(
                        "connection closed by server".into(),
                    ));
                }
            };
            let received_at = self.clock.now_millis();

            match InboundMessage::from_json_str(&text) {
                Ok(message) => {
                    debug!(
                        kind = message.kind(),
                        server_time = message.server_time(),
                        "live message received"
                    );
                    let ended = matches!(
                        &message,
                        InboundMessage::PhaseSignal(signal) if signal.phase == WirePhase::Ended
                    );
                    if !self
                        .emit(ChannelEvent::Message {
                            message,
                            received_at,
                        })
                        .await
                    {
                        return SessionEnd::Shutdown;
                    }
                    if ended {
                        return SessionEnd::ContestEnded;
                    }
                }
                Err(err) => {
                    malformed += 1;
                    warn!(error = %err, malformed, "dropping malformed live message");
                    if malformed >= self.settings.malformed_message_threshold {
                        return SessionEnd::Failed(TransportError::TooManyMalformed {
                            count: malformed,
                        });
                    }
                }
            }
        }
    }

    async fn terminate(&self, error: ChannelError, retry_count: u32, last_error: Option<String>) {
        if self
            .emit(ChannelEvent::Status(connection(
                ChannelStatus::Closed,
                retry_count,
                last_error,
            )))
            .await
        {
            self.emit(ChannelEvent::Terminated(error)).await;
        }
    }

    async fn emit(&self, event: ChannelEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

fn connection(status: ChannelStatus, retry_count: u32, last_error: Option<String>) -> ChannelConnection {
    ChannelConnection {
        status,
        retry_count,
        last_error,
    }
}
