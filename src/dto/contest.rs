use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnNull, serde_as};

use crate::dto::phase::WirePhase;

/// Response of `GET /contests/{id}`. Times are epoch milliseconds.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestDocument {
    /// Contest identifier.
    pub id: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Scheduled start.
    pub start_time: i64,
    /// Scheduled end.
    pub end_time: i64,
    /// Server clock at the time the response was produced.
    pub server_time: i64,
    /// Phase as computed by the server, when it chooses to send it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WirePhase>,
    /// The caller's registration, `null` when not registered.
    #[serde(default)]
    pub registration: Option<RegistrationRecord>,
    /// Problem list; empty until the contest starts.
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    pub problems: Vec<ProblemSummary>,
}

/// Registration state the server holds for the authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecord {
    /// What the server recorded.
    pub status: RecordStatus,
    /// When the server confirmed it.
    #[serde(default)]
    pub confirmed_at: Option<i64>,
}

/// Server-side registration status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Registered ahead of the start.
    Registered,
    /// Joined the running contest.
    Participating,
}

/// Minimal problem listing handed to the problem renderer once the contest is live.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemSummary {
    /// Problem identifier (`A`, `B`, ...).
    pub id: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
}

/// Successful answer to `POST /contests/{id}/register` and `POST /contests/{id}/join`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResponse {
    /// Server clock when the action was processed.
    pub server_time: i64,
    /// Resulting server-side status.
    pub status: RecordStatus,
    /// When the server recorded the action.
    #[serde(default)]
    pub confirmed_at: Option<i64>,
}

/// Error body returned with 4xx/5xx responses.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Machine-readable reason such as `registration_closed`.
    pub reason: String,
    /// Human-readable explanation.
    #[serde(default)]
    pub message: String,
}
