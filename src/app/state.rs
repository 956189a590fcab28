//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::SessionStore;
use crate::rating::RatingStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionStore>,
    pub ratings: Arc<RatingStore>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        // Blocking read of the ledger file, once at startup
        let ratings = Arc::new(RatingStore::load(
            config.rating_store_path.clone(),
            config.rating,
        ));

        let sessions = SessionStore::new(ratings.clone(), config.engine);

        Self::from_parts(config, sessions, ratings)
    }

    pub fn from_parts(config: Config, sessions: Arc<SessionStore>, ratings: Arc<RatingStore>) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
            ratings,
        }
    }
}
