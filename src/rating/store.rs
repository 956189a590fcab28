//! Process-wide rating ledger with durable JSON persistence

use parking_lot::Mutex;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::RatingConfig;
use crate::game::r#match::MatchOutcome;
use crate::util::time::unix_millis;

use super::ledger::{LeaderboardEntry, RatingChange, WeeklyLedger};

const WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum RatingStoreError {
    #[error("Ledger I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Ledger document is malformed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Ranked view for the HTTP surface
#[derive(Debug, Clone, Serialize)]
pub struct Leaderboard {
    pub week_start: u64,
    pub entries: Vec<LeaderboardEntry>,
}

/// Single owner of the weekly ledger. Every access goes through the mutex
/// because the week rollover is check-then-act.
pub struct RatingStore {
    ledger: Mutex<WeeklyLedger>,
    path: PathBuf,
    config: RatingConfig,
}

impl RatingStore {
    /// Load the ledger from disk, starting empty if it is missing or unreadable
    pub fn load(path: impl Into<PathBuf>, config: RatingConfig) -> Self {
        let path = path.into();
        let now = unix_millis();

        let mut ledger = match read_ledger(&path) {
            Ok(Some(ledger)) => {
                info!(path = %path.display(), players = ledger.players.len(), "Loaded rating ledger");
                ledger
            }
            Ok(None) => WeeklyLedger::new(now),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable rating ledger, starting fresh");
                WeeklyLedger::new(now)
            }
        };

        if ledger.roll_over(now) {
            info!(week_start = ledger.week_start, "Stored ledger is from a previous week, reset");
        }

        Self {
            ledger: Mutex::new(ledger),
            path,
            config,
        }
    }

    /// Apply a decisive match result and persist it. Blocking: call from a
    /// blocking thread.
    pub fn record_result(&self, outcome: &MatchOutcome) -> Option<RatingChange> {
        self.record_result_at(outcome, unix_millis())
    }

    pub fn record_result_at(&self, outcome: &MatchOutcome, now: u64) -> Option<RatingChange> {
        let (Some(winner_id), Some(loser_id)) = (&outcome.winner_id, &outcome.loser_id) else {
            info!(match_id = %outcome.match_id, "Missing identity, rating not updated");
            return None;
        };

        let mut ledger = self.ledger.lock();
        let change = ledger.record_win(
            (winner_id.as_str(), outcome.winner_alias.as_deref()),
            (loser_id.as_str(), outcome.loser_alias.as_deref()),
            now,
            &self.config,
        )?;

        info!(
            match_id = %outcome.match_id,
            winner = %winner_id,
            loser = %loser_id,
            delta = change.delta,
            "Ratings updated"
        );

        // The match result stands even if the write fails
        if let Err(e) = self.persist_with_retry(&ledger) {
            error!(match_id = %outcome.match_id, error = %e, "Failed to persist rating ledger");
        }

        Some(change)
    }

    pub fn rating_of(&self, player_id: &str) -> i32 {
        self.ledger.lock().rating(player_id, unix_millis(), &self.config)
    }

    pub fn leaderboard(&self, limit: usize) -> Leaderboard {
        self.leaderboard_at(limit, unix_millis())
    }

    pub fn leaderboard_at(&self, limit: usize, now: u64) -> Leaderboard {
        let mut ledger = self.ledger.lock();
        let entries = ledger.top(now, limit);
        Leaderboard {
            week_start: ledger.week_start,
            entries,
        }
    }

    fn persist_with_retry(&self, ledger: &WeeklyLedger) -> Result<(), RatingStoreError> {
        let mut attempt = 1;
        loop {
            match write_ledger(&self.path, ledger) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(attempt, error = %e, "Rating ledger write failed, retrying");
                    std::thread::sleep(Duration::from_millis(50 * u64::from(attempt)));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn read_ledger(path: &Path) -> Result<Option<WeeklyLedger>, RatingStoreError> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write to a sibling temp file, fsync, then rename over the target
fn write_ledger(path: &Path, ledger: &WeeklyLedger) -> Result<(), RatingStoreError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    let bytes = serde_json::to_vec_pretty(ledger)?;
    let tmp = path.with_extension("json.tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rating::ledger::week_start;
    use crate::ws::protocol::{EndReason, Side};
    use tokio_test::assert_ok;

    const DAY: u64 = 24 * 60 * 60 * 1_000;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("disc-duel-ratings-{}", uuid::Uuid::new_v4()))
            .join("ledger.json")
    }

    fn outcome(winner: &str, loser: &str) -> MatchOutcome {
        MatchOutcome {
            match_id: "m-1".into(),
            winner: Side::Creator,
            reason: EndReason::Goals,
            winner_id: Some(winner.into()),
            winner_alias: Some(winner.to_uppercase()),
            loser_id: Some(loser.into()),
            loser_alias: None,
        }
    }

    #[test]
    fn test_result_is_persisted_and_reloaded() {
        let path = temp_path();
        let now = unix_millis();
        let store = RatingStore::load(&path, RatingConfig::default());

        let change = store.record_result_at(&outcome("alice", "bob"), now).unwrap();
        assert_eq!(change.winner_rating, 1016);

        let raw = assert_ok!(fs::read_to_string(&path));
        let doc: serde_json::Value = assert_ok!(serde_json::from_str(&raw));
        assert_eq!(doc["week_start"], week_start(now));
        assert_eq!(doc["players"]["alice"]["rating"], 1016);
        assert_eq!(doc["players"]["alice"]["display_name"], "ALICE");

        let reloaded = RatingStore::load(&path, RatingConfig::default());
        assert_eq!(reloaded.rating_of("alice"), 1016);
        assert_eq!(reloaded.rating_of("bob"), 984);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_missing_identity_skips_update() {
        let store = RatingStore::load(temp_path(), RatingConfig::default());
        let mut anonymous = outcome("alice", "bob");
        anonymous.loser_id = None;
        assert!(store.record_result(&anonymous).is_none());
        assert!(store.leaderboard(10).entries.is_empty());
    }

    #[test]
    fn test_leaderboard_read_rolls_week_over() {
        let store = RatingStore::load(temp_path(), RatingConfig::default());
        let now = unix_millis();
        store.record_result_at(&outcome("alice", "bob"), now);
        assert_eq!(store.leaderboard_at(10, now).entries.len(), 2);

        let next_week = week_start(now) + 8 * DAY;
        let board = store.leaderboard_at(10, next_week);
        assert!(board.entries.is_empty());
        assert_eq!(board.week_start, week_start(next_week));
    }

    #[test]
    fn test_unwritable_path_keeps_in_memory_result() {
        // A directory where the file should be makes every write fail
        let path = temp_path();
        fs::create_dir_all(&path).unwrap();
        let store = RatingStore::load(&path, RatingConfig::default());

        let change = store.record_result(&outcome("alice", "bob"));
        assert!(change.is_some());
        assert_eq!(store.rating_of("alice"), 1016);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_corrupt_file_starts_fresh() {
        let path = temp_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{ not json").unwrap();
        let store = RatingStore::load(&path, RatingConfig::default());
        assert_eq!(store.rating_of("anyone"), 1000);
        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
