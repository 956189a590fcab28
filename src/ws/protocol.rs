//! WebSocket protocol message definitions
//! These are the wire types for client-server communication

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One of the two seats in a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Opened the match (defends the bottom goal)
    Creator,
    /// Joined the match (defends the top goal)
    Challenger,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Creator, Side::Challenger];

    pub fn other(self) -> Self {
        match self {
            Side::Creator => Side::Challenger,
            Side::Challenger => Side::Creator,
        }
    }
}

/// A value kept per side
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SidePair<T> {
    pub creator: T,
    pub challenger: T,
}

impl<T> SidePair<T> {
    pub fn new(creator: T, challenger: T) -> Self {
        Self { creator, challenger }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Creator => &self.creator,
            Side::Challenger => &self.challenger,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Creator => &mut self.creator,
            Side::Challenger => &mut self.challenger,
        }
    }
}

/// Stake metadata reported by clients; opaque to the engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeInfo {
    #[serde(default)]
    pub staked: bool,
    #[serde(default)]
    pub amount: String,
    #[serde(default)]
    pub token: String,
}

/// Settings applied when a join creates the session
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchSettings {
    /// First to this many goals wins (ignored in timed mode)
    #[serde(default)]
    pub goal_target: Option<u32>,
    /// Timed mode: match length before golden goal
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default)]
    pub stake: Option<StakeInfo>,
}

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMsg {
    /// Declare presence in a match as one side
    JoinMatch {
        match_id: String,
        side: Side,
        /// Identity used for rating attribution
        #[serde(default)]
        player_id: Option<String>,
        /// Display name
        #[serde(default)]
        alias: Option<String>,
        /// Only used if this join creates the session
        #[serde(default)]
        settings: Option<MatchSettings>,
    },

    /// Flick a disc
    Input {
        match_id: String,
        entity_id: u32,
        dx: f32,
        dy: f32,
    },

    /// Ask the opponent for another game
    RequestRematch {
        match_id: String,
        #[serde(default)]
        alias: Option<String>,
    },

    AcceptRematch {
        match_id: String,
    },

    DeclineRematch {
        match_id: String,
    },

    /// Staked rematch: the new on-chain match this client ended up in
    ConfirmRematch {
        match_id: String,
        new_match_id: String,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMsg {
    /// Welcome message after connection
    Welcome {
        connection_id: Uuid,
        server_time: u64,
    },

    /// Full session state
    Snapshot(MatchSnapshot),

    /// Discrete notification
    Event {
        event: GameEvent,
    },

    /// Match is over
    MatchEnded {
        winner: Side,
        reason: EndReason,
        score: SidePair<u32>,
    },

    /// Unstaked rematch: both sides move to this match
    RematchRedirect {
        match_id: String,
    },

    /// Staked rematch: clients must create a new on-chain match with these parameters
    RematchBlockchainRequired {
        requested_by: Side,
        staked: bool,
        amount: String,
        token: String,
        goal_target: u32,
        duration_secs: Option<u64>,
    },

    /// Staked rematch: both clients confirmed the same new match
    RematchBlockchainReady {
        match_id: String,
    },

    /// Error message (transport-level problems only)
    Error {
        code: String,
        message: String,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Coarse phase for clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    Paused,
    AwaitingInput,
    Simulating,
    Ended,
}

/// Why a match ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Goals,
    GoldenGoal,
    TimeoutForfeit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKindName {
    Disc,
    Ball,
}

/// Entity state in a snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: u32,
    pub kind: EntityKindName,
    /// Owning side (discs only)
    pub owner: Option<Side>,
    pub x: f32,
    pub y: f32,
    pub vx: f32,
    pub vy: f32,
    pub radius: f32,
    /// Primary/secondary display colors (discs only)
    pub colors: Option<[String; 2]>,
}

/// Complete observable state of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: String,
    pub phase: PhaseName,
    pub active: Side,
    /// Unix ms; absent while paused, simulating or ended
    pub turn_deadline: Option<u64>,
    pub score: SidePair<u32>,
    pub connected: SidePair<bool>,
    pub aliases: SidePair<Option<String>>,
    pub timeouts: SidePair<u32>,
    pub goal_target: u32,
    /// Timed mode: when regulation time runs out (unix ms)
    pub match_ends_at: Option<u64>,
    pub golden_goal: bool,
    pub kickoff: bool,
    pub winner: Option<Side>,
    pub end_reason: Option<EndReason>,
    pub entities: Vec<EntitySnapshot>,
    pub server_time: u64,
}

/// Game events (goals, timeouts, rematch handshake)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GameEvent {
    PlayerConnected {
        side: Side,
    },

    PlayerDisconnected {
        side: Side,
    },

    Goal {
        scorer: Side,
        score: SidePair<u32>,
    },

    /// Goal on a kickoff move; ball was recentred
    KickoffGoalVoided {
        scorer: Side,
    },

    /// Active side ran out of time
    Timeout {
        side: Side,
        strikes: u32,
    },

    /// Timed match clock expired; next goal wins
    GoldenGoal,

    RematchRequested {
        from: Side,
        alias: Option<String>,
        expires_at: u64,
    },

    RematchAccepted {
        by: Side,
    },

    RematchDeclined {
        by: Side,
    },

    RematchExpired,
}
