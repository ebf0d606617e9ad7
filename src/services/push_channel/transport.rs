//! Wire transports for the live channel.
//!
//! A transport only yields raw text frames; parsing, clock sampling and reconnection are
//! handled by the channel manager so every transport behaves the same way.

use std::{sync::Arc, time::Duration};

use futures::{
    StreamExt,
    future::BoxFuture,
    stream::BoxStream,
};
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, warn};

use crate::{
    dto::{
        channel::{InboundMessage, LeaderboardPayload, PhaseSignalPayload},
        phase::WirePhase,
    },
    error::TransportError,
    services::contest_api::ContestApi,
    state::phase::ContestPhase,
};

/// Frames received on one connection. The stream ends when the peer closes it.
pub type MessageStream = BoxStream<'static, Result<String, TransportError>>;

/// Opens live connections for a contest.
pub trait PushTransport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;
    /// Open a new connection.
    fn connect(&self, contest_id: &str) -> BoxFuture<'static, Result<MessageStream, TransportError>>;
}

#[cfg(feature = "ws-transport")]
pub use ws::WsTransport;

#[cfg(feature = "ws-transport")]
mod ws {
    use std::sync::Arc;

    use futures::{StreamExt, future::BoxFuture};
    use tokio_tungstenite::{
        connect_async,
        tungstenite::{
            Message,
            client::IntoClientRequest,
            http::{HeaderValue, header::AUTHORIZATION},
        },
    };
    use tracing::debug;

    use super::{MessageStream, PushTransport};
    use crate::{config::SyncConfig, error::TransportError};

    /// WebSocket transport (`{channel_base_url}/contests/{id}/live`).
    #[derive(Clone)]
    pub struct WsTransport {
        base_url: Arc<str>,
        token: Option<Arc<str>>,
    }

    impl WsTransport {
        /// Connect to `config.channel_base_url`, sending `token` as a bearer credential.
        pub fn new(config: &SyncConfig, token: Option<String>) -> Self {
            Self {
                base_url: Arc::from(config.channel_base_url.trim_end_matches('/')),
                token: token.map(Arc::from),
            }
        }
    }

    impl PushTransport for WsTransport {
        fn name(&self) -> &'static str {
            "websocket"
        }

        fn connect(
            &self,
            contest_id: &str,
        ) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
            let url = format!("{}/contests/{contest_id}/live", self.base_url);
            let token = self.token.clone();
            Box::pin(async move {
                let mut request = url
                    .as_str()
                    .into_client_request()
                    .map_err(|err| TransportError::Connect(err.to_string()))?;
                if let Some(token) = token {
                    let value = HeaderValue::from_str(&format!("Bearer {token}"))
                        .map_err(|err| TransportError::Connect(err.to_string()))?;
                    request.headers_mut().insert(AUTHORIZATION, value);
                }

                let (mut socket, _) = connect_async(request)
                    .await
                    .map_err(|err| TransportError::Connect(err.to_string()))?;
                debug!(url, "websocket connected");

                let frames = async_stream::stream! {
                    while let Some(frame) = socket.next().await {
                        match frame {
                            Ok(Message::Text(text)) => yield Ok(text.as_str().to_owned()),
                            Ok(Message::Binary(bytes)) => {
                                yield Ok(String::from_utf8_lossy(&bytes).into_owned())
                            }
                            Ok(Message::Close(frame)) => {
                                debug!(?frame, "websocket closed by server");
                                break;
                            }
                            Ok(_) => {}
                            Err(err) => {
                                yield Err(TransportError::Receive(err.to_string()));
                                break;
                            }
                        }
                    }
                };
                Ok(frames.boxed())
            })
        }
    }
}

/// REST polling that speaks the same message protocol as the live channel.
///
/// Each round re-fetches the contest document and the leaderboard and emits a
/// `phase_signal` followed by a `leaderboard_snapshot`.
#[derive(Clone)]
pub struct PollingTransport {
    api: Arc<dyn ContestApi>,
    poll_interval: Duration,
}

impl PollingTransport {
    /// Poll through `api` every `poll_interval`.
    pub fn new(api: Arc<dyn ContestApi>, poll_interval: Duration) -> Self {
        Self { api, poll_interval }
    }
}

impl PushTransport for PollingTransport {
    fn name(&self) -> &'static str {
        "polling"
    }

    fn connect(&self, contest_id: &str) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
        let api = self.api.clone();
        let period = self.poll_interval;
        let contest_id = contest_id.to_owned();
        Box::pin(async move {
            // Fail the connection attempt itself when the API is unreachable.
            let first = api
                .fetch_contest(&contest_id)
                .await
                .map_err(TransportError::Poll)?;

            let frames = async_stream::stream! {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker.tick().await;
                let mut document = Some(first);

                loop {
                    let contest = match document.take() {
                        Some(contest) => contest,
                        None => {
                            ticker.tick().await;
                            match api.fetch_contest(&contest_id).await {
                                Ok(contest) => contest,
                                Err(err) => {
                                    yield Err(TransportError::Poll(err));
                                    break;
                                }
                            }
                        }
                    };

                    let phase = contest.phase.unwrap_or_else(|| {
                        ContestPhase::derive(contest.start_time, contest.end_time, contest.server_time)
                            .into()
                    });
                    let signal = InboundMessage::PhaseSignal(PhaseSignalPayload {
                        server_time: contest.server_time,
                        phase,
                        start_time: Some(contest.start_time),
                        end_time: Some(contest.end_time),
                    });
                    yield encode(&signal);
                    if phase == WirePhase::Ended {
                        break;
                    }

                    match api.fetch_leaderboard(&contest_id).await {
                        Ok(board) => {
                            let snapshot = InboundMessage::LeaderboardSnapshot(LeaderboardPayload {
                                server_time: board.server_time,
                                entries: board.entries,
                            });
                            yield encode(&snapshot);
                        }
                        Err(err) => {
                            yield Err(TransportError::Poll(err));
                            break;
                        }
                    }
                }
            };
            Ok(frames.boxed())
        })
    }
}

fn encode(message: &InboundMessage) -> Result<String, TransportError> {
    message
        .to_json_string()
        .map_err(|err| TransportError::Receive(err.to_string()))
}

/// Try `primary` first and degrade to `fallback` when it cannot connect.
pub struct FallbackTransport {
    primary: Arc<dyn PushTransport>,
    fallback: Arc<dyn PushTransport>,
}

impl FallbackTransport {
    /// Try `primary` first and use `fallback` when it refuses to connect.
    pub fn new(primary: Arc<dyn PushTransport>, fallback: Arc<dyn PushTransport>) -> Self {
        Self { primary, fallback }
    }
}

impl PushTransport for FallbackTransport {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    fn connect(&self, contest_id: &str) -> BoxFuture<'static, Result<MessageStream, TransportError>> {
        let primary = self.primary.connect(contest_id);
        let fallback = self.fallback.clone();
        let contest_id = contest_id.to_owned();
        Box::pin(async move {
            match primary.await {
                Ok(stream) => Ok(stream),
                Err(err) => {
                    warn!(
                        error = %err,
                        fallback = fallback.name(),
                        "live transport unavailable; degrading"
                    );
                    let stream = fallback.connect(&contest_id).await?;
                    debug!(fallback = fallback.name(), "fallback transport connected");
                    Ok(stream)
                }
            }
        })
    }
}
