use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    dto::{leaderboard::LeaderboardRow, phase::WirePhase},
    error::ProtocolError,
};

/// Messages pushed by the server over the live channel.
///
/// Every kind carries `serverTime` so each message doubles as a clock sample.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Full replacement of the leaderboard.
    LeaderboardSnapshot(LeaderboardPayload),
    /// Upserts for a subset of participants.
    LeaderboardDelta(LeaderboardPayload),
    /// Free-form organiser announcement.
    Announcement(AnnouncementPayload),
    /// Authoritative phase change, optionally with corrected boundaries.
    PhaseSignal(PhaseSignalPayload),
    /// Number of participants currently in the contest.
    ParticipantCount(ParticipantCountPayload),
}

/// Body of leaderboard snapshot and delta messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPayload {
    /// Server clock when the message was produced.
    pub server_time: i64,
    /// Rows to replace or merge.
    #[serde(default)]
    #[validate(nested)]
    pub entries: Vec<LeaderboardRow>,
}

/// Body of an announcement message.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementPayload {
    /// Server clock when the message was produced.
    pub server_time: i64,
    /// Stable id, when the server assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Text shown to participants.
    #[validate(length(min = 1))]
    pub message: String,
}

/// Body of a phase signal.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseSignalPayload {
    /// Server clock when the message was produced.
    pub server_time: i64,
    /// Phase the server considers current.
    pub phase: WirePhase,
    /// New start boundary, when it moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    /// New end boundary, when it moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<i64>,
}

/// Body of a participant count update.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantCountPayload {
    /// Server clock when the message was produced.
    pub server_time: i64,
    /// Number of participants currently in the contest.
    pub count: u64,
}

impl InboundMessage {
    /// Parse and validate a text frame.
    pub fn from_json_str(text: &str) -> Result<Self, ProtocolError> {
        let message = serde_json::from_str::<Self>(text)?;
        message.validate_payload()?;
        Ok(message)
    }

    /// Serialise back to JSON; used by the polling fallback to speak the same protocol.
    pub fn to_json_string(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Server timestamp carried by the message.
    pub fn server_time(&self) -> i64 {
        match self {
            Self::LeaderboardSnapshot(payload) | Self::LeaderboardDelta(payload) => {
                payload.server_time
            }
            Self::Announcement(payload) => payload.server_time,
            Self::PhaseSignal(payload) => payload.server_time,
            Self::ParticipantCount(payload) => payload.server_time,
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::LeaderboardSnapshot(_) => "leaderboard_snapshot",
            Self::LeaderboardDelta(_) => "leaderboard_delta",
            Self::Announcement(_) => "announcement",
            Self::PhaseSignal(_) => "phase_signal",
            Self::ParticipantCount(_) => "participant_count",
        }
    }

    fn validate_payload(&self) -> Result<(), ProtocolError> {
        if self.server_time() <= 0 {
            return Err(ProtocolError::Invalid(format!(
                "{} carries non-positive serverTime",
                self.kind()
            )));
        }
        match self {
            Self::LeaderboardSnapshot(payload) | Self::LeaderboardDelta(payload) => {
                payload.validate()?
            }
            Self::Announcement(payload) => payload.validate()?,
            Self::PhaseSignal(payload) => {
                if let (Some(start), Some(end)) = (payload.start_time, payload.end_time) {
                    if end < start {
                        return Err(ProtocolError::Invalid(
                            "phase signal ends before it starts".into(),
                        ));
                    }
                }
            }
            Self::ParticipantCount(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_delta_with_server_time() {
        let message = InboundMessage::from_json_str(
            r#"{"type":"leaderboard_delta","serverTime":1700000000000,
                "entries":[{"userId":"B","problemsSolved":3,"totalTime":90}]}"#,
        )
        .unwrap();
        assert_eq!(message.server_time(), 1_700_000_000_000);
        match message {
            InboundMessage::LeaderboardDelta(payload) => {
                assert_eq!(payload.entries, vec![LeaderboardRow::new("B", 3, 90)]);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn parses_phase_signal_with_new_boundaries() {
        let message = InboundMessage::from_json_str(
            r#"{"type":"phase_signal","serverTime":10,"phase":"upcoming","startTime":500,"endTime":900}"#,
        )
        .unwrap();
        assert_eq!(
            message,
            InboundMessage::PhaseSignal(PhaseSignalPayload {
                server_time: 10,
                phase: WirePhase::Upcoming,
                start_time: Some(500),
                end_time: Some(900),
            })
        );
    }

    #[test]
    fn unknown_kind_is_malformed() {
        let err = InboundMessage::from_json_str(r#"{"type":"submission","serverTime":10}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn empty_user_id_is_invalid() {
        let err = InboundMessage::from_json_str(
            r#"{"type":"leaderboard_snapshot","serverTime":10,
                "entries":[{"userId":"","problemsSolved":1,"totalTime":5}]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Invalid(_)));
    }

    #[test]
    fn missing_server_time_is_malformed() {
        let err =
            InboundMessage::from_json_str(r#"{"type":"participant_count","count":3}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }
}
