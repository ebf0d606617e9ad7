//! JSON wire types exchanged with the contest server over REST and the live channel.

use time::{OffsetDateTime, format_description::well_known::Rfc3339};

/// Push-channel messages.
pub mod channel;
/// REST contest document and action payloads.
pub mod contest;
/// Leaderboard rows and documents.
pub mod leaderboard;
/// Wire representation of the contest phase.
pub mod phase;

/// Render an epoch-milliseconds instant as RFC 3339 for logs and terminal output.
pub fn format_instant(millis: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .ok()
        .and_then(|instant| instant.format(&Rfc3339).ok())
        .unwrap_or_else(|| "invalid-timestamp".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_epoch_millis() {
        assert_eq!(format_instant(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_instant(86_400_000), "1970-01-02T00:00:00Z");
    }
}
