//! Match engine: physics kernel, state machine, timeout policy, rematch, sessions

pub mod physics;
pub mod r#match;
pub mod rematch;
pub mod session;
pub mod snapshot;
pub mod timeout;

pub use r#match::MatchEvent;
pub use session::{MatchHandle, SessionStore};

use crate::ws::protocol::{ServerMsg, Side};

/// A message on a session's broadcast channel, optionally addressed to one side
#[derive(Debug, Clone)]
pub struct Outbound {
    pub to: Option<Side>,
    pub msg: ServerMsg,
}

impl Outbound {
    pub fn all(msg: ServerMsg) -> Self {
        Self { to: None, msg }
    }

    pub fn to(side: Side, msg: ServerMsg) -> Self {
        Self {
            to: Some(side),
            msg,
        }
    }

    /// Should a subscriber seated at `side` see this?
    pub fn is_for(&self, side: Option<Side>) -> bool {
        match (self.to, side) {
            (None, _) => true,
            (Some(target), Some(side)) => target == side,
            (Some(_), None) => false,
        }
    }
}
