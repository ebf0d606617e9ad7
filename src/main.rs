//! `contest-watch`: follow a contest from the terminal.
//!
//! Usage: `contest-watch <contest-id> [register|join]`

use std::{env, sync::Arc};

use anyhow::{Context, bail};
use contest_sync::{
    ContestSync, SyncConfig,
    error::ActionError,
    services::{
        contest_api::{ContestApi, HttpContestApi},
        push_channel::transport::{FallbackTransport, PollingTransport, PushTransport, WsTransport},
        sync_events::{describe, event_name},
    },
    state::{
        bus::SyncEvent,
        clock::SystemClock,
        phase::ContestPhase,
        registration::RegistrationSession,
        timer::{TimerSnapshot, format_remaining},
    },
};
use futures::StreamExt;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TOKEN_ENV: &str = "CONTEST_SYNC_TOKEN";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = env::args().skip(1);
    let contest_id = args
        .next()
        .context("usage: contest-watch <contest-id> [register|join]")?;
    let action = args.next();
    if let Some(other) = action
        .as_deref()
        .filter(|action| !matches!(*action, "register" | "join"))
    {
        bail!("unknown action `{other}`; expected `register` or `join`");
    }

    let config = SyncConfig::load();
    let token = env::var(TOKEN_ENV).ok();
    if token.is_none() {
        warn!("{TOKEN_ENV} not set; requests are sent unauthenticated");
    }

    let api: Arc<dyn ContestApi> = Arc::new(
        HttpContestApi::new(&config, token.clone()).context("building contest API client")?,
    );
    let transport: Arc<dyn PushTransport> = Arc::new(FallbackTransport::new(
        Arc::new(WsTransport::new(&config, token)),
        Arc::new(PollingTransport::new(api.clone(), config.poll_interval)),
    ));
    let tick_interval = config.tick_interval;

    let sync = ContestSync::start(config, contest_id, api, transport, Arc::new(SystemClock))
        .await
        .context("loading contest")?;
    info!(contest_id = sync.contest_id(), title = sync.title(), "watching contest");

    match action.as_deref() {
        Some("register") => report_action("register", sync.register().await),
        Some("join") => report_action("join", sync.join().await),
        _ => {}
    }

    let mut events = sync.stream().boxed();
    let views = sync.views();
    let mut countdown = interval(tick_interval);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            event = events.next() => match event {
                Some(event) => {
                    info!(event = event_name(&event), "{}", describe(&event));
                    if matches!(event, SyncEvent::PhaseChanged { to: ContestPhase::Ended, .. }) {
                        info!("contest over");
                    }
                }
                None => break,
            },
            _ = countdown.tick() => {
                let phase = *views.phase.borrow();
                if phase == ContestPhase::Ended {
                    break;
                }
                let timers = *views.countdown.borrow();
                info!(phase = ?phase, "{}", countdown_line(phase, &timers));
            }
        }
    }

    let board = views.leaderboard.borrow().clone();
    for entry in board.entries.iter().take(10) {
        info!(
            rank = entry.rank,
            user = %entry.username,
            solved = entry.problems_solved,
            time = entry.total_time,
            "leaderboard"
        );
    }

    sync.shutdown().await;
    Ok(())
}

fn report_action(action: &str, outcome: Result<RegistrationSession, ActionError>) {
    match outcome {
        Ok(session) => info!(action, status = ?session.status, "action succeeded"),
        Err(err) => warn!(action, failure = %err.failure, retryable = err.is_retryable(), "{err}"),
    }
}

fn countdown_line(phase: ContestPhase, timers: &TimerSnapshot) -> String {
    match phase {
        ContestPhase::Upcoming => format!(
            "starts in {}",
            format_remaining(timers.start.remaining_millis)
        ),
        ContestPhase::Live => format!("ends in {}", format_remaining(timers.end.remaining_millis)),
        ContestPhase::Ended => "ended".to_owned(),
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,contest_sync=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler; only Ctrl+C is honoured");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
