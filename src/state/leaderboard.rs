//! Leaderboard merging.
//!
//! Snapshots replace the board, deltas upsert by user id. After every mutation the board is
//! re-sorted (`problems_solved` desc, `total_time` asc, `user_id` asc) and ranks are derived
//! from position; ranks received from the server are ignored.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::dto::leaderboard::LeaderboardRow;

/// One ranked participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderboardEntry {
    /// Participant identifier.
    pub user_id: String,
    /// 1-based position in the sorted board.
    pub rank: u32,
    /// Solved problem count.
    pub problems_solved: u32,
    /// Penalty time in seconds.
    pub total_time: u64,
    /// Display name, falling back to the user id.
    pub username: String,
    /// Avatar URL.
    pub profile_image: Option<String>,
}

/// Read-only view handed to subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leaderboard {
    /// Entries in rank order.
    pub entries: Vec<LeaderboardEntry>,
    /// Server time of the newest update folded in.
    pub as_of: i64,
    /// Set once the contest ended; deltas are no longer applied.
    pub frozen: bool,
}

impl Leaderboard {
    /// Look up a participant.
    pub fn entry(&self, user_id: &str) -> Option<&LeaderboardEntry> {
        self.entries.iter().find(|entry| entry.user_id == user_id)
    }
}

/// Why an update was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skipped {
    /// Deltas are ignored once the contest ended.
    Frozen,
    /// The update predates the snapshot currently in place.
    Stale,
}

/// Single writer of the leaderboard.
#[derive(Debug, Default)]
pub struct LeaderboardMerger {
    entries: IndexMap<String, LeaderboardEntry>,
    snapshot_time: i64,
    as_of: i64,
    frozen: bool,
}

impl LeaderboardMerger {
    /// Empty, unfrozen board.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole board. Snapshots older than anything already folded in are skipped.
    pub fn apply_snapshot(
        &mut self,
        server_time: i64,
        rows: Vec<LeaderboardRow>,
    ) -> Result<(), Skipped> {
        if server_time < self.as_of {
            return Err(Skipped::Stale);
        }

        self.entries.clear();
        for row in rows {
            // Duplicate user ids within a snapshot: the last row wins.
            let entry = new_entry(row);
            self.entries.insert(entry.user_id.clone(), entry);
        }
        self.snapshot_time = server_time;
        self.as_of = server_time;
        self.resort();
        Ok(())
    }

    /// Upsert the given rows. Unknown users are inserted.
    pub fn apply_delta(
        &mut self,
        server_time: i64,
        rows: Vec<LeaderboardRow>,
    ) -> Result<(), Skipped> {
        if self.frozen {
            return Err(Skipped::Frozen);
        }
        if server_time < self.snapshot_time {
            return Err(Skipped::Stale);
        }

        for row in rows {
            match self.entries.get_mut(&row.user_id) {
                Some(existing) => {
                    existing.problems_solved = row.problems_solved;
                    existing.total_time = row.total_time;
                    if let Some(username) = row.username {
                        existing.username = username;
                    }
                    if row.profile_image.is_some() {
                        existing.profile_image = row.profile_image;
                    }
                }
                None => {
                    let entry = new_entry(row);
                    self.entries.insert(entry.user_id.clone(), entry);
                }
            }
        }
        self.as_of = self.as_of.max(server_time);
        self.resort();
        Ok(())
    }

    /// Stop applying deltas (contest ended).
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Accept deltas again (server moved the contest out of `Ended`).
    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    /// Whether deltas are currently ignored.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Current board in rank order.
    pub fn leaderboard(&self) -> Leaderboard {
        Leaderboard {
            entries: self.entries.values().cloned().collect(),
            as_of: self.as_of,
            frozen: self.frozen,
        }
    }

    fn resort(&mut self) {
        self.entries.sort_by(|_, a, _, b| ranking_order(a, b));
        for (position, entry) in self.entries.values_mut().enumerate() {
            entry.rank = u32::try_from(position + 1).unwrap_or(u32::MAX);
        }
    }
}

fn ranking_order(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    b.problems_solved
        .cmp(&a.problems_solved)
        .then(a.total_time.cmp(&b.total_time))
        .then_with(|| a.user_id.cmp(&b.user_id))
}

fn new_entry(row: LeaderboardRow) -> LeaderboardEntry {
    LeaderboardEntry {
        username: row.username.unwrap_or_else(|| row.user_id.clone()),
        user_id: row.user_id,
        rank: 0,
        problems_solved: row.problems_solved,
        total_time: row.total_time,
        profile_image: row.profile_image,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(user: &str, solved: u32, time: u64) -> LeaderboardRow {
        LeaderboardRow::new(user, solved, time)
    }

    fn order(merger: &LeaderboardMerger) -> Vec<(String, u32)> {
        merger
            .leaderboard()
            .entries
            .into_iter()
            .map(|entry| (entry.user_id, entry.rank))
            .collect()
    }

    #[test]
    fn delta_reorders_tied_snapshot() {
        let mut merger = LeaderboardMerger::new();
        merger
            .apply_snapshot(10, vec![row("A", 2, 100), row("B", 2, 100)])
            .unwrap();
        assert_eq!(order(&merger), vec![("A".into(), 1), ("B".into(), 2)]);

        merger.apply_delta(11, vec![row("B", 3, 90)]).unwrap();
        let board = merger.leaderboard();
        assert_eq!(board.entries[0].user_id, "B");
        assert_eq!(board.entries[0].problems_solved, 3);
        assert_eq!(board.entries[0].total_time, 90);
        assert_eq!(board.entries[1].user_id, "A");
        assert_eq!(board.entries[1].rank, 2);
    }

    #[test]
    fn ties_break_on_user_id_regardless_of_arrival() {
        let mut merger = LeaderboardMerger::new();
        merger
            .apply_snapshot(1, vec![row("zed", 1, 50), row("amy", 1, 50)])
            .unwrap();
        merger.apply_delta(2, vec![row("bob", 1, 50)]).unwrap();
        assert_eq!(
            order(&merger),
            vec![("amy".into(), 1), ("bob".into(), 2), ("zed".into(), 3)]
        );
    }

    #[test]
    fn unknown_user_in_delta_is_inserted() {
        let mut merger = LeaderboardMerger::new();
        merger.apply_snapshot(1, vec![row("A", 1, 10)]).unwrap();
        merger
            .apply_delta(
                2,
                vec![LeaderboardRow {
                    username: Some("newcomer".into()),
                    ..row("N", 2, 30)
                }],
            )
            .unwrap();
        let board = merger.leaderboard();
        let newcomer = board.entry("N").unwrap();
        assert_eq!(newcomer.rank, 1);
        assert_eq!(newcomer.username, "newcomer");
        assert_eq!(board.entry("A").unwrap().rank, 2);
    }

    #[test]
    fn transmitted_ranks_are_ignored() {
        let mut merger = LeaderboardMerger::new();
        merger
            .apply_snapshot(
                1,
                vec![
                    LeaderboardRow {
                        rank: Some(1),
                        ..row("slow", 1, 500)
                    },
                    LeaderboardRow {
                        rank: Some(7),
                        ..row("fast", 1, 100)
                    },
                ],
            )
            .unwrap();
        assert_eq!(order(&merger), vec![("fast".into(), 1), ("slow".into(), 2)]);
    }

    #[test]
    fn delta_keeps_known_presentation_fields() {
        let mut merger = LeaderboardMerger::new();
        merger
            .apply_snapshot(
                1,
                vec![LeaderboardRow {
                    username: Some("Ada".into()),
                    profile_image: Some("ada.png".into()),
                    ..row("A", 0, 0)
                }],
            )
            .unwrap();
        merger.apply_delta(2, vec![row("A", 1, 42)]).unwrap();
        let board = merger.leaderboard();
        let ada = board.entry("A").unwrap();
        assert_eq!(ada.username, "Ada");
        assert_eq!(ada.profile_image.as_deref(), Some("ada.png"));
        assert_eq!(ada.problems_solved, 1);
    }

    #[test]
    fn deltas_older_than_snapshot_are_skipped() {
        let mut merger = LeaderboardMerger::new();
        merger.apply_snapshot(100, vec![row("A", 3, 10)]).unwrap();
        assert_eq!(
            merger.apply_delta(99, vec![row("A", 2, 10)]),
            Err(Skipped::Stale)
        );
        assert_eq!(merger.leaderboard().entry("A").unwrap().problems_solved, 3);
        assert_eq!(
            merger.apply_snapshot(50, Vec::new()),
            Err(Skipped::Stale)
        );
    }

    #[test]
    fn frozen_board_accepts_only_snapshots() {
        let mut merger = LeaderboardMerger::new();
        merger.apply_snapshot(1, vec![row("A", 1, 10)]).unwrap();
        merger.freeze();
        assert_eq!(
            merger.apply_delta(2, vec![row("A", 9, 1)]),
            Err(Skipped::Frozen)
        );
        merger
            .apply_snapshot(3, vec![row("A", 2, 20), row("B", 1, 5)])
            .unwrap();
        let board = merger.leaderboard();
        assert!(board.frozen);
        assert_eq!(board.entries.len(), 2);
    }

    #[test]
    fn resync_reproduces_uninterrupted_board() {
        let log = vec![
            (2, vec![row("A", 1, 10)]),
            (3, vec![row("B", 1, 8)]),
            (4, vec![row("C", 2, 30)]),
            (5, vec![row("A", 2, 25)]),
            (6, vec![row("B", 3, 40)]),
        ];
        let initial = vec![row("A", 0, 0), row("B", 0, 0)];

        let mut uninterrupted = LeaderboardMerger::new();
        uninterrupted.apply_snapshot(1, initial.clone()).unwrap();
        for (time, rows) in log.clone() {
            uninterrupted.apply_delta(time, rows).unwrap();
        }

        // Deltas 3 and 4 are lost while disconnected; the resync snapshot reflects them.
        let mut resynced = LeaderboardMerger::new();
        resynced.apply_snapshot(1, initial).unwrap();
        resynced.apply_delta(2, log[0].1.clone()).unwrap();
        let server_state: Vec<LeaderboardRow> = {
            let mut server = LeaderboardMerger::new();
            server.apply_snapshot(1, vec![row("A", 0, 0), row("B", 0, 0)]).unwrap();
            for (time, rows) in log[..3].iter().cloned() {
                server.apply_delta(time, rows).unwrap();
            }
            server
                .leaderboard()
                .entries
                .into_iter()
                .map(|entry| row(&entry.user_id, entry.problems_solved, entry.total_time))
                .collect()
        };
        resynced.apply_snapshot(4, server_state).unwrap();
        for (time, rows) in log[3..].iter().cloned() {
            resynced.apply_delta(time, rows).unwrap();
        }

        assert_eq!(
            resynced.leaderboard().entries,
            uninterrupted.leaderboard().entries
        );
    }
}
