//! In-memory weekly rating ledger and the Elo update

use chrono::{Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::RatingConfig;

const WEEK_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Unix ms of Monday 00:00 UTC of the week containing `now`
pub fn week_start(now: u64) -> u64 {
    let Some(moment) = Utc.timestamp_millis_opt(now as i64).single() else {
        return now - now % WEEK_MS;
    };
    let date = moment.date_naive();
    let monday = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
    monday
        .and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight).timestamp_millis() as u64)
        .unwrap_or(now)
}

/// Rating delta for a decisive result, already clamped
pub fn elo_delta(winner_rating: i32, loser_rating: i32, config: &RatingConfig) -> i32 {
    let diff = f64::from(loser_rating - winner_rating);
    let expected = 1.0 / (1.0 + 10f64.powf(diff / 400.0));
    let raw = (config.k_factor * (1.0 - expected)).round() as i32;
    raw.clamp(config.min_delta, config.max_delta)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingEntry {
    pub rating: i32,
    #[serde(default)]
    pub display_name: Option<String>,
    pub last_update: u64,
}

/// Result of one rating update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatingChange {
    pub delta: i32,
    pub winner_rating: i32,
    pub loser_rating: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub rank: usize,
    pub player_id: String,
    pub display_name: Option<String>,
    pub rating: i32,
}

/// Ratings for one week; also the persisted document layout
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyLedger {
    pub week_start: u64,
    #[serde(default)]
    pub players: BTreeMap<String, RatingEntry>,
}

impl WeeklyLedger {
    pub fn new(now: u64) -> Self {
        Self {
            week_start: week_start(now),
            players: BTreeMap::new(),
        }
    }

    /// Start over if `now` is in a different week. Returns true on rollover.
    pub fn roll_over(&mut self, now: u64) -> bool {
        let current = week_start(now);
        if current == self.week_start {
            return false;
        }
        self.week_start = current;
        self.players.clear();
        true
    }

    pub fn rating(&mut self, player_id: &str, now: u64, config: &RatingConfig) -> i32 {
        self.roll_over(now);
        self.players
            .get(player_id)
            .map(|e| e.rating)
            .unwrap_or(config.default_rating)
    }

    /// Apply a win. Returns `None` when both identities are the same player.
    pub fn record_win(
        &mut self,
        winner: (&str, Option<&str>),
        loser: (&str, Option<&str>),
        now: u64,
        config: &RatingConfig,
    ) -> Option<RatingChange> {
        if winner.0 == loser.0 {
            return None;
        }
        self.roll_over(now);

        let winner_rating = self.rating(winner.0, now, config);
        let loser_rating = self.rating(loser.0, now, config);
        let delta = elo_delta(winner_rating, loser_rating, config);

        let winner_rating = winner_rating + delta;
        let loser_rating = (loser_rating - delta).max(0);

        self.upsert(winner, winner_rating, now);
        self.upsert(loser, loser_rating, now);

        Some(RatingChange {
            delta,
            winner_rating,
            loser_rating,
        })
    }

    fn upsert(&mut self, (player_id, name): (&str, Option<&str>), rating: i32, now: u64) {
        let entry = self
            .players
            .entry(player_id.to_string())
            .or_insert_with(|| RatingEntry {
                rating,
                display_name: None,
                last_update: now,
            });
        entry.rating = rating;
        entry.last_update = now;
        if let Some(name) = name {
            entry.display_name = Some(name.to_string());
        }
    }

    /// Highest ratings first, ties broken by identity
    pub fn top(&mut self, now: u64, limit: usize) -> Vec<LeaderboardEntry> {
        self.roll_over(now);

        let mut ranked: Vec<(&String, &RatingEntry)> = self.players.iter().collect();
        ranked.sort_by(|a, b| b.1.rating.cmp(&a.1.rating).then_with(|| a.0.cmp(b.0)));

        ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(i, (id, entry))| LeaderboardEntry {
                rank: i + 1,
                player_id: id.clone(),
                display_name: entry.display_name.clone(),
                rating: entry.rating,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Monday 2024-01-01 00:00:00 UTC
    const MONDAY: u64 = 1_704_067_200_000;
    const DAY: u64 = 24 * 60 * 60 * 1_000;

    fn config() -> RatingConfig {
        RatingConfig::default()
    }

    #[test]
    fn test_week_start_is_monday_midnight() {
        assert_eq!(week_start(MONDAY), MONDAY);
        assert_eq!(week_start(MONDAY + 3 * DAY + 12_345), MONDAY);
        assert_eq!(week_start(MONDAY + 7 * DAY - 1), MONDAY);
        assert_eq!(week_start(MONDAY + 7 * DAY), MONDAY + 7 * DAY);
    }

    #[test]
    fn test_equal_ratings_swing_half_k() {
        assert_eq!(elo_delta(1000, 1000, &config()), 16);
    }

    #[test]
    fn test_delta_is_clamped() {
        let tight = RatingConfig {
            min_delta: 5,
            max_delta: 10,
            ..config()
        };
        // Heavy favourite barely gains, underdog gains a lot
        assert_eq!(elo_delta(2000, 1000, &tight), 5);
        assert_eq!(elo_delta(1000, 2000, &tight), 10);
    }

    #[test]
    fn test_record_win_updates_both_players() {
        let mut ledger = WeeklyLedger::new(MONDAY);
        let change = ledger
            .record_win(("alice", Some("Alice")), ("bob", None), MONDAY + 10, &config())
            .unwrap();
        assert_eq!(change.delta, 16);
        assert_eq!(ledger.rating("alice", MONDAY + 20, &config()), 1016);
        assert_eq!(ledger.rating("bob", MONDAY + 20, &config()), 984);
        assert_eq!(ledger.players["alice"].display_name.as_deref(), Some("Alice"));
        assert_eq!(ledger.players["bob"].last_update, MONDAY + 10);
    }

    #[test]
    fn test_loser_floored_at_zero() {
        let mut ledger = WeeklyLedger::new(MONDAY);
        for id in ["alice", "bob"] {
            ledger.players.insert(
                id.into(),
                RatingEntry {
                    rating: 10,
                    display_name: None,
                    last_update: MONDAY,
                },
            );
        }
        let change = ledger
            .record_win(("alice", None), ("bob", None), MONDAY, &config())
            .unwrap();
        assert_eq!(change.delta, 16);
        assert_eq!(change.loser_rating, 0);
        assert_eq!(change.winner_rating, 26);
        assert_eq!(ledger.players["bob"].rating, 0);
    }

    #[test]
    fn test_self_play_is_ignored() {
        let mut ledger = WeeklyLedger::new(MONDAY);
        assert!(ledger.record_win(("a", None), ("a", None), MONDAY, &config()).is_none());
        assert!(ledger.players.is_empty());
    }

    #[test]
    fn test_new_week_resets_ratings() {
        let mut ledger = WeeklyLedger::new(MONDAY);
        ledger.players.insert(
            "a".into(),
            RatingEntry {
                rating: 1200,
                display_name: None,
                last_update: MONDAY,
            },
        );
        assert_eq!(ledger.rating("a", MONDAY + DAY, &config()), 1200);
        assert_eq!(ledger.rating("a", MONDAY + 8 * DAY, &config()), 1000);
        assert!(ledger.players.is_empty());
        assert_eq!(ledger.week_start, MONDAY + 7 * DAY);
    }

    #[test]
    fn test_top_sorted_by_rating_then_identity() {
        let mut ledger = WeeklyLedger::new(MONDAY);
        for (id, rating) in [("carol", 1010), ("bob", 1050), ("alice", 1010), ("dave", 990)] {
            ledger.players.insert(
                id.into(),
                RatingEntry {
                    rating,
                    display_name: None,
                    last_update: MONDAY,
                },
            );
        }
        let top = ledger.top(MONDAY, 3);
        let ids: Vec<&str> = top.iter().map(|e| e.player_id.as_str()).collect();
        assert_eq!(ids, vec!["bob", "alice", "carol"]);
        assert_eq!(top[0].rank, 1);
        assert_eq!(top[2].rank, 3);
    }
}
