use std::sync::Arc;

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tracing::warn;

use crate::{
    dto::contest::ProblemSummary,
    error::ChannelError,
    state::{
        clock::ClockConfidence,
        connection::ChannelConnection,
        leaderboard::Leaderboard,
        phase::{ContestPhase, TransitionSource},
        registration::RegistrationSession,
    },
};

/// Notifications published by a contest session.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The displayed phase changed.
    PhaseChanged {
        /// Previous phase.
        from: ContestPhase,
        /// New phase.
        to: ContestPhase,
        /// What caused the change.
        source: TransitionSource,
    },
    /// The leaderboard was replaced or updated.
    LeaderboardUpdated(Arc<Leaderboard>),
    /// Organiser announcement.
    Announcement {
        /// Announcement id, when present.
        id: Option<String>,
        /// Announcement text.
        message: String,
        /// Server time of the announcement.
        server_time: i64,
    },
    /// Participant count pushed by the server.
    ParticipantCount(u64),
    /// Live channel connectivity changed.
    ConnectionChanged(ChannelConnection),
    /// Trust in the corrected clock changed.
    ClockConfidence(ClockConfidence),
    /// Registration/participation status changed.
    RegistrationChanged(RegistrationSession),
    /// The contest document was refetched.
    ContestRefreshed {
        /// Current start boundary.
        start_time: i64,
        /// Current end boundary.
        end_time: i64,
        /// Visible problems; empty until the contest is live.
        problems: Vec<ProblemSummary>,
    },
    /// The live channel stopped for good.
    ChannelTerminated(ChannelError),
}

/// Typed publish/subscribe channel scoped to one contest session.
///
/// Dropping the last clone closes every subscription, so nothing outlives the session.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    /// Construct a new bus backed by a Tokio broadcast channel with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register a new subscriber that will receive subsequent events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a stream; lagged events are skipped with a warning.
    pub fn stream(&self) -> impl Stream<Item = SyncEvent> + Send + 'static {
        BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move {
            match item {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; events dropped");
                    None
                }
            }
        })
    }

    /// Send an event to all current subscribers, ignoring the no-subscriber case.
    pub fn publish(&self, event: SyncEvent) {
        let _ = self.sender.send(event);
    }
}
