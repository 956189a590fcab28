//! Weekly Elo leaderboard

pub mod ledger;
pub mod store;

pub use store::{Leaderboard, RatingStore};
