use serde::{Deserialize, Serialize};
use serde_with::{DefaultOnNull, serde_as};
use validator::Validate;

/// A leaderboard row as transmitted by the server.
///
/// `rank` may be present on the wire but is never trusted; ranks are derived locally.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    /// Participant identifier.
    #[validate(length(min = 1, max = 128))]
    pub user_id: String,
    /// Server-assigned rank; recomputed locally when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
    /// Solved problem count.
    pub problems_solved: u32,
    /// Accumulated penalty time in seconds.
    pub total_time: u64,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Avatar URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

impl LeaderboardRow {
    /// Row without presentation fields, handy for deltas.
    pub fn new(user_id: impl Into<String>, problems_solved: u32, total_time: u64) -> Self {
        Self {
            user_id: user_id.into(),
            rank: None,
            problems_solved,
            total_time,
            username: None,
            profile_image: None,
        }
    }
}

/// Response of `GET /contests/{id}/leaderboard`.
#[serde_as]
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDocument {
    /// Server clock when the board was computed.
    pub server_time: i64,
    /// Full board, in any order.
    #[serde_as(as = "DefaultOnNull")]
    #[serde(default)]
    #[validate(nested)]
    pub entries: Vec<LeaderboardRow>,
}
