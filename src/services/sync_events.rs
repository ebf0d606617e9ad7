//! Human-readable rendering of [`SyncEvent`]s for logs and terminal output.

use crate::{
    dto::format_instant,
    state::{
        bus::SyncEvent,
        clock::ClockConfidence,
        connection::ChannelStatus,
        phase::TransitionSource,
        registration::RegistrationStatus,
    },
};

const EVENT_PHASE_CHANGED: &str = "phase.changed";
const EVENT_LEADERBOARD_UPDATED: &str = "leaderboard.updated";
const EVENT_ANNOUNCEMENT: &str = "announcement";
const EVENT_PARTICIPANT_COUNT: &str = "participants.count";
const EVENT_CONNECTION_CHANGED: &str = "channel.status";
const EVENT_CLOCK_CONFIDENCE: &str = "clock.confidence";
const EVENT_REGISTRATION_CHANGED: &str = "registration.changed";
const EVENT_CONTEST_REFRESHED: &str = "contest.refreshed";
const EVENT_CHANNEL_TERMINATED: &str = "channel.terminated";

/// Stable dotted name of an event, suitable as a log field.
pub fn event_name(event: &SyncEvent) -> &'static str {
    match event {
        SyncEvent::PhaseChanged { .. } => EVENT_PHASE_CHANGED,
        SyncEvent::LeaderboardUpdated(_) => EVENT_LEADERBOARD_UPDATED,
        SyncEvent::Announcement { .. } => EVENT_ANNOUNCEMENT,
        SyncEvent::ParticipantCount(_) => EVENT_PARTICIPANT_COUNT,
        SyncEvent::ConnectionChanged(_) => EVENT_CONNECTION_CHANGED,
        SyncEvent::ClockConfidence(_) => EVENT_CLOCK_CONFIDENCE,
        SyncEvent::RegistrationChanged(_) => EVENT_REGISTRATION_CHANGED,
        SyncEvent::ContestRefreshed { .. } => EVENT_CONTEST_REFRESHED,
        SyncEvent::ChannelTerminated(_) => EVENT_CHANNEL_TERMINATED,
    }
}

/// One-line summary of an event.
pub fn describe(event: &SyncEvent) -> String {
    match event {
        SyncEvent::PhaseChanged { from, to, source } => {
            let cause = match source {
                TransitionSource::Timer(boundary) => format!("{boundary:?} timer"),
                TransitionSource::Server => "server signal".to_owned(),
            };
            format!("{from:?} -> {to:?} ({cause})")
        }
        SyncEvent::LeaderboardUpdated(board) => {
            let leader = board
                .entries
                .first()
                .map(|entry| {
                    format!(
                        "leader {} with {} solved",
                        entry.username, entry.problems_solved
                    )
                })
                .unwrap_or_else(|| "no entries".to_owned());
            let frozen = if board.frozen { ", final" } else { "" };
            format!("{} participants, {leader}{frozen}", board.entries.len())
        }
        SyncEvent::Announcement {
            message,
            server_time,
            ..
        } => format!("[{}] {message}", format_instant(*server_time)),
        SyncEvent::ParticipantCount(count) => format!("{count} participants online"),
        SyncEvent::ConnectionChanged(connection) => {
            let status = match connection.status {
                ChannelStatus::Connecting => "connecting",
                ChannelStatus::Open => "open",
                ChannelStatus::Reconnecting => "reconnecting",
                ChannelStatus::Closed => "closed",
            };
            match (&connection.last_error, connection.retry_count) {
                (Some(error), retries) if connection.status == ChannelStatus::Reconnecting => {
                    format!("{status} (retry {retries}): {error}")
                }
                _ => status.to_owned(),
            }
        }
        SyncEvent::ClockConfidence(confidence) => match confidence {
            ClockConfidence::Unsynchronized => "clock not synchronised yet".to_owned(),
            ClockConfidence::Synchronized => "clock synchronised".to_owned(),
            ClockConfidence::Stale => "clock may be inaccurate".to_owned(),
        },
        SyncEvent::RegistrationChanged(session) => {
            let status = match session.status {
                RegistrationStatus::None => "not registered",
                RegistrationStatus::Pending => "pending",
                RegistrationStatus::Registered => "registered",
                RegistrationStatus::Participating => "participating",
                RegistrationStatus::Failed => "failed",
            };
            match &session.last_failure {
                Some(failure) if session.status == RegistrationStatus::Failed => {
                    format!("{status} ({failure})")
                }
                _ => status.to_owned(),
            }
        }
        SyncEvent::ContestRefreshed {
            start_time,
            end_time,
            problems,
        } => format!(
            "{} -> {}, {} problems visible",
            format_instant(*start_time),
            format_instant(*end_time),
            problems.len()
        ),
        SyncEvent::ChannelTerminated(error) => error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        error::{ActionFailure, ChannelError},
        state::{
            connection::ChannelConnection,
            leaderboard::{Leaderboard, LeaderboardEntry},
            phase::ContestPhase,
            registration::RegistrationSession,
            timer::Boundary,
        },
    };

    #[test]
    fn describes_phase_changes() {
        let event = SyncEvent::PhaseChanged {
            from: ContestPhase::Upcoming,
            to: ContestPhase::Live,
            source: TransitionSource::Timer(Boundary::Start),
        };
        assert_eq!(event_name(&event), "phase.changed");
        assert_eq!(describe(&event), "Upcoming -> Live (Start timer)");
    }

    #[test]
    fn describes_leaderboard_leader() {
        let board = Leaderboard {
            entries: vec![LeaderboardEntry {
                user_id: "u1".into(),
                rank: 1,
                problems_solved: 4,
                total_time: 900,
                username: "ada".into(),
                profile_image: None,
            }],
            as_of: 1,
            frozen: true,
        };
        assert_eq!(
            describe(&SyncEvent::LeaderboardUpdated(Arc::new(board))),
            "1 participants, leader ada with 4 solved, final"
        );
    }

    #[test]
    fn reconnecting_status_mentions_error() {
        let event = SyncEvent::ConnectionChanged(ChannelConnection {
            status: ChannelStatus::Reconnecting,
            retry_count: 2,
            last_error: Some("refused".into()),
        });
        assert_eq!(describe(&event), "reconnecting (retry 2): refused");
    }

    #[test]
    fn failed_registration_shows_reason() {
        let event = SyncEvent::RegistrationChanged(RegistrationSession {
            status: RegistrationStatus::Failed,
            server_confirmed_at: None,
            last_failure: Some(ActionFailure::Rejected {
                reason: "contest_full".into(),
            }),
        });
        assert_eq!(describe(&event), "failed (rejected:contest_full)");
        assert_eq!(
            describe(&SyncEvent::ChannelTerminated(ChannelError::ContestEnded)),
            "contest ended; push channel closed"
        );
    }
}
