//! Match state machine: the authoritative state of one session and its transitions
//!
//! [`MatchState::apply`] is the only way state changes. It never blocks and never
//! fails; illegal or stale actions simply produce no effects.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::time::SIMULATION_TPS;
use crate::ws::protocol::{
    EndReason, GameEvent, MatchSettings, PhaseName, ServerMsg, Side, SidePair, StakeInfo,
};

use super::physics::{ColorPair, Entity, Field, PhysicsSystem, Vec2, MAX_IMPULSE};
use super::rematch::{RematchNegotiation, RematchOutcome};
use super::snapshot::build_snapshot;
use super::timeout::{TimeoutPolicy, TimeoutVerdict};
use super::Outbound;

pub const DEFAULT_GOAL_TARGET: u32 = 3;
pub const MAX_GOAL_TARGET: u32 = 10;
pub const MIN_TIMED_SECS: u64 = 30;
pub const MAX_TIMED_SECS: u64 = 1_800;

pub const DISCS_PER_SIDE: u32 = 3;
pub const BALL_ID: u32 = 0;

/// Simulation safety valve: a move never runs longer than this
pub const MAX_SIM_TICKS: u32 = 12 * SIMULATION_TPS;

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Not both sides connected; no clock running
    Paused,
    /// Active side must move before the deadline (unix ms)
    AwaitingInput { deadline: u64 },
    /// Physics is running
    Simulating { ticks: u32 },
    /// Terminal
    Ended { winner: Side, reason: EndReason },
}

impl MatchPhase {
    pub fn name(&self) -> PhaseName {
        match self {
            MatchPhase::Paused => PhaseName::Paused,
            MatchPhase::AwaitingInput { .. } => PhaseName::AwaitingInput,
            MatchPhase::Simulating { .. } => PhaseName::Simulating,
            MatchPhase::Ended { .. } => PhaseName::Ended,
        }
    }
}

/// Fixed parameters of a match, chosen when the session is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchConfig {
    pub goal_target: u32,
    /// Timed mode when set
    pub duration_ms: Option<u64>,
    pub stake: StakeInfo,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            goal_target: DEFAULT_GOAL_TARGET,
            duration_ms: None,
            stake: StakeInfo::default(),
        }
    }
}

impl MatchConfig {
    pub fn from_settings(settings: Option<&MatchSettings>) -> Self {
        let Some(settings) = settings else {
            return Self::default();
        };
        Self {
            goal_target: settings
                .goal_target
                .unwrap_or(DEFAULT_GOAL_TARGET)
                .clamp(1, MAX_GOAL_TARGET),
            duration_ms: settings
                .duration_secs
                .map(|secs| secs.clamp(MIN_TIMED_SECS, MAX_TIMED_SECS) * 1_000),
            stake: settings.stake.clone().unwrap_or_default(),
        }
    }

    pub fn is_timed(&self) -> bool {
        self.duration_ms.is_some()
    }
}

/// Timer lengths handed down from configuration
#[derive(Debug, Clone, Copy)]
pub struct MatchTimings {
    pub turn_ms: u64,
    pub rematch_window_ms: u64,
}

impl Default for MatchTimings {
    fn default() -> Self {
        Self {
            turn_ms: 20_000,
            rematch_window_ms: 30_000,
        }
    }
}

/// Who sits in a seat
#[derive(Debug, Clone, Default)]
pub struct PlayerSlot {
    /// Open channels claiming this side
    pub connections: u32,
    pub player_id: Option<String>,
    pub alias: Option<String>,
}

impl PlayerSlot {
    pub fn connected(&self) -> bool {
        self.connections > 0
    }
}

/// Inbound stimulus for a session
#[derive(Debug, Clone)]
pub enum MatchEvent {
    Join {
        side: Side,
        player_id: Option<String>,
        alias: Option<String>,
    },
    Leave {
        side: Side,
    },
    Input {
        side: Side,
        entity_id: u32,
        dx: f32,
        dy: f32,
    },
    /// One simulation step
    Tick,
    /// A turn deadline, rematch expiry or match clock may have elapsed
    Timer,
    RequestRematch {
        side: Side,
        alias: Option<String>,
    },
    RespondRematch {
        side: Side,
        accept: bool,
    },
    ConfirmRematch {
        side: Side,
        new_match_id: String,
    },
}

/// Decisive result handed to the rating ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOutcome {
    pub match_id: String,
    pub winner: Side,
    pub reason: EndReason,
    pub winner_id: Option<String>,
    pub winner_alias: Option<String>,
    pub loser_id: Option<String>,
    pub loser_alias: Option<String>,
}

/// Everything a follow-up session needs to start like this one
#[derive(Debug, Clone)]
pub struct RematchPlan {
    pub match_id: String,
    pub config: MatchConfig,
    pub players: SidePair<PlayerSlot>,
}

/// Side effects produced by a transition, executed in order by the session task
#[derive(Debug, Clone)]
pub enum Effect {
    Publish(Outbound),
    Concluded(MatchOutcome),
    SpawnRematch(RematchPlan),
}

/// Authoritative state of one match
#[derive(Debug, Clone)]
pub struct MatchState {
    pub id: String,
    pub config: MatchConfig,
    pub phase: MatchPhase,
    pub active: Side,
    pub players: SidePair<PlayerSlot>,
    pub score: SidePair<u32>,
    pub strikes: SidePair<u32>,
    /// Next goal is void (first motion after a reset)
    pub kickoff: bool,
    pub discs: Vec<Entity>,
    pub ball: Entity,
    /// Timed mode: when regulation ends (set on first resume)
    pub match_ends_at: Option<u64>,
    pub golden_goal: bool,
    pub field: Field,
    timings: MatchTimings,
    policy: TimeoutPolicy,
    rematch: RematchNegotiation,
}

impl MatchState {
    pub fn new(id: impl Into<String>, config: MatchConfig, timings: MatchTimings) -> Self {
        let field = Field::default();
        let (discs, ball) = formation(&field);
        Self {
            id: id.into(),
            config,
            phase: MatchPhase::Paused,
            active: Side::Creator,
            players: SidePair::default(),
            score: SidePair::default(),
            strikes: SidePair::default(),
            kickoff: true,
            discs,
            ball,
            match_ends_at: None,
            golden_goal: false,
            field,
            timings,
            policy: TimeoutPolicy::default(),
            rematch: RematchNegotiation::new(timings.rematch_window_ms),
        }
    }

    /// Seed a rematch session with the previous players
    pub fn from_plan(plan: RematchPlan, timings: MatchTimings) -> Self {
        let mut state = Self::new(plan.match_id, plan.config, timings);
        for side in Side::BOTH {
            let previous = plan.players.get(side);
            let slot = state.players.get_mut(side);
            slot.player_id = previous.player_id.clone();
            slot.alias = previous.alias.clone();
        }
        state
    }

    pub fn connected(&self) -> SidePair<bool> {
        SidePair::new(self.players.creator.connected(), self.players.challenger.connected())
    }

    pub fn both_connected(&self) -> bool {
        self.players.creator.connected() && self.players.challenger.connected()
    }

    pub fn anyone_connected(&self) -> bool {
        self.players.creator.connected() || self.players.challenger.connected()
    }

    pub fn is_simulating(&self) -> bool {
        matches!(self.phase, MatchPhase::Simulating { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self.phase, MatchPhase::Ended { .. })
    }

    pub fn turn_deadline(&self) -> Option<u64> {
        match self.phase {
            MatchPhase::AwaitingInput { deadline } => Some(deadline),
            _ => None,
        }
    }

    /// Earliest wall-clock instant at which a `Timer` event matters
    pub fn next_wake(&self) -> Option<u64> {
        let clock = match (self.match_ends_at, self.golden_goal, self.is_ended()) {
            (Some(at), false, false) => Some(at),
            _ => None,
        };
        [self.turn_deadline(), self.rematch.next_expiry(), clock]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        std::iter::once(&self.ball).chain(self.discs.iter())
    }

    /// Single transition function
    pub fn apply(&mut self, event: MatchEvent, now: u64) -> Vec<Effect> {
        let mut fx = Vec::new();
        self.refresh_clock(now, &mut fx);

        match event {
            MatchEvent::Join {
                side,
                player_id,
                alias,
            } => self.handle_join(side, player_id, alias, now, &mut fx),
            MatchEvent::Leave { side } => self.handle_leave(side, now, &mut fx),
            MatchEvent::Input {
                side,
                entity_id,
                dx,
                dy,
            } => self.handle_input(side, entity_id, Vec2::new(dx, dy), now, &mut fx),
            MatchEvent::Tick => self.handle_tick(now, &mut fx),
            MatchEvent::Timer => self.handle_timer(now, &mut fx),
            MatchEvent::RequestRematch { side, alias } => {
                if self.is_ended() {
                    let alias = alias.or_else(|| self.players.get(side).alias.clone());
                    let outcome = self.rematch.request(side, alias, now, self.config.stake.staked);
                    self.apply_rematch(outcome, &mut fx);
                }
            }
            MatchEvent::RespondRematch { side, accept } => {
                if self.is_ended() {
                    let outcome = self.rematch.respond(side, accept, now, self.config.stake.staked);
                    self.apply_rematch(outcome, &mut fx);
                }
            }
            MatchEvent::ConfirmRematch { side, new_match_id } => {
                if self.is_ended() {
                    let outcome = self.rematch.confirm(side, new_match_id);
                    self.apply_rematch(outcome, &mut fx);
                }
            }
        }

        fx
    }

    // ------------------------------------------------------------------
    // Connection handling
    // ------------------------------------------------------------------

    fn handle_join(
        &mut self,
        side: Side,
        player_id: Option<String>,
        alias: Option<String>,
        now: u64,
        fx: &mut Vec<Effect>,
    ) {
        let slot = self.players.get_mut(side);
        let was_connected = slot.connected();
        slot.connections += 1;
        if player_id.is_some() {
            slot.player_id = player_id;
        }
        if alias.is_some() {
            slot.alias = alias;
        }

        if !was_connected {
            info!(match_id = %self.id, side = ?side, "Side connected");
            self.push_event(GameEvent::PlayerConnected { side }, fx);
        }

        if self.phase == MatchPhase::Paused && self.both_connected() {
            self.open_turn(now);
            if let (Some(duration), None) = (self.config.duration_ms, self.match_ends_at) {
                self.match_ends_at = Some(now + duration);
            }
            info!(match_id = %self.id, active = ?self.active, "Match resumed");
        }

        self.push_snapshot(now, fx);
    }

    fn handle_leave(&mut self, side: Side, now: u64, fx: &mut Vec<Effect>) {
        let slot = self.players.get_mut(side);
        if slot.connections == 0 {
            return;
        }
        slot.connections -= 1;
        if slot.connected() {
            return;
        }

        info!(match_id = %self.id, side = ?side, "Side disconnected");
        self.push_event(GameEvent::PlayerDisconnected { side }, fx);

        // A running simulation finishes first; the pause happens at turn end
        if matches!(self.phase, MatchPhase::AwaitingInput { .. }) {
            self.phase = MatchPhase::Paused;
        }
        self.push_snapshot(now, fx);
    }

    // ------------------------------------------------------------------
    // Turn flow
    // ------------------------------------------------------------------

    fn handle_input(&mut self, side: Side, entity_id: u32, impulse: Vec2, now: u64, fx: &mut Vec<Effect>) {
        if !matches!(self.phase, MatchPhase::AwaitingInput { .. }) || side != self.active {
            debug!(match_id = %self.id, side = ?side, "Dropping out-of-turn input");
            return;
        }
        if !impulse.is_finite() || impulse == Vec2::ZERO {
            debug!(match_id = %self.id, side = ?side, "Dropping degenerate impulse");
            return;
        }
        let Some(disc) = self
            .discs
            .iter_mut()
            .find(|d| d.id == entity_id && d.owner() == Some(side))
        else {
            debug!(match_id = %self.id, entity_id, "Dropping input for foreign entity");
            return;
        };

        disc.vel = disc.vel.add(impulse.clamp_length(MAX_IMPULSE));
        self.policy.on_move(side, &mut self.strikes);
        self.phase = MatchPhase::Simulating { ticks: 0 };
        self.push_snapshot(now, fx);
    }

    fn handle_tick(&mut self, now: u64, fx: &mut Vec<Effect>) {
        let MatchPhase::Simulating { ticks } = self.phase else {
            return;
        };
        let ticks = ticks + 1;
        self.phase = MatchPhase::Simulating { ticks };

        self.step_physics();

        if let Some(scorer) = PhysicsSystem::detect_goal(&self.ball, &self.field) {
            self.handle_goal(scorer, now, fx);
            return;
        }

        let settled = PhysicsSystem::all_settled(self.entities());
        if settled || ticks >= MAX_SIM_TICKS {
            if !settled {
                warn!(match_id = %self.id, ticks, "Simulation hit safety valve, ending turn");
                for entity in self.discs.iter_mut().chain(std::iter::once(&mut self.ball)) {
                    entity.vel = Vec2::ZERO;
                }
            }
            self.active = self.active.other();
            self.kickoff = false;
            self.open_turn(now);
        }
        self.push_snapshot(now, fx);
    }

    fn step_physics(&mut self) {
        for entity in self.discs.iter_mut().chain(std::iter::once(&mut self.ball)) {
            PhysicsSystem::integrate(entity);
            PhysicsSystem::reflect_boundary(entity, &self.field);
        }

        for i in 0..self.discs.len() {
            let (head, tail) = self.discs.split_at_mut(i + 1);
            let a = &mut head[i];
            for b in tail.iter_mut() {
                PhysicsSystem::resolve_collision(a, b);
            }
            PhysicsSystem::resolve_collision(a, &mut self.ball);
        }
    }

    fn handle_goal(&mut self, scorer: Side, now: u64, fx: &mut Vec<Effect>) {
        if self.kickoff {
            // Exactly one void goal per reset
            self.kickoff = false;
            self.ball = Entity::ball(BALL_ID, self.field.center());
            info!(match_id = %self.id, scorer = ?scorer, "Kickoff goal voided");
            self.push_event(GameEvent::KickoffGoalVoided { scorer }, fx);
            self.push_snapshot(now, fx);
            return;
        }

        *self.score.get_mut(scorer) += 1;
        info!(
            match_id = %self.id,
            scorer = ?scorer,
            creator = self.score.creator,
            challenger = self.score.challenger,
            "Goal"
        );
        self.push_event(
            GameEvent::Goal {
                scorer,
                score: self.score,
            },
            fx,
        );

        let decisive = if self.config.is_timed() {
            self.golden_goal.then_some(EndReason::GoldenGoal)
        } else {
            (*self.score.get(scorer) >= self.config.goal_target).then_some(EndReason::Goals)
        };

        if let Some(reason) = decisive {
            self.finish(scorer, reason, now, fx);
            return;
        }

        let (discs, ball) = formation(&self.field);
        self.discs = discs;
        self.ball = ball;
        self.active = scorer.other();
        self.kickoff = true;
        self.open_turn(now);
        self.push_snapshot(now, fx);
    }

    fn handle_timer(&mut self, now: u64, fx: &mut Vec<Effect>) {
        if let Some(offer) = self.rematch.expire(now) {
            debug!(match_id = %self.id, from = ?offer.from, "Rematch offer expired");
            self.push_event(GameEvent::RematchExpired, fx);
        }

        let MatchPhase::AwaitingInput { deadline } = self.phase else {
            return;
        };
        if now < deadline {
            return;
        }

        match self.policy.on_deadline(self.active, self.connected(), &mut self.strikes) {
            TimeoutVerdict::Repause => {
                self.phase = MatchPhase::Paused;
                self.push_snapshot(now, fx);
            }
            TimeoutVerdict::SkipTurn { side, strikes } => {
                info!(match_id = %self.id, side = ?side, strikes, "Turn timed out");
                self.push_event(GameEvent::Timeout { side, strikes }, fx);
                self.active = side.other();
                self.open_turn(now);
                self.push_snapshot(now, fx);
            }
            TimeoutVerdict::Forfeit { loser, strikes } => {
                info!(match_id = %self.id, loser = ?loser, strikes, "Forfeit after repeated timeouts");
                self.push_event(GameEvent::Timeout { side: loser, strikes }, fx);
                let winner = loser.other();
                let current = *self.score.get(winner);
                let awarded = if self.config.is_timed() {
                    // No target in timed mode; finish one clear of the loser
                    current.max(self.score.get(loser) + 1)
                } else {
                    current.max(self.config.goal_target)
                };
                *self.score.get_mut(winner) = awarded;
                *self.score.get_mut(loser) = 0;
                self.finish(winner, EndReason::TimeoutForfeit, now, fx);
            }
        }
    }

    /// Start the clock for the active side, or pause if someone is missing
    fn open_turn(&mut self, now: u64) {
        self.phase = if self.both_connected() {
            MatchPhase::AwaitingInput {
                deadline: now + self.timings.turn_ms,
            }
        } else {
            MatchPhase::Paused
        };
    }

    fn refresh_clock(&mut self, now: u64, fx: &mut Vec<Effect>) {
        if self.golden_goal || self.is_ended() {
            return;
        }
        if let Some(ends_at) = self.match_ends_at {
            if now >= ends_at {
                self.golden_goal = true;
                info!(match_id = %self.id, "Regulation time over, golden goal");
                self.push_event(GameEvent::GoldenGoal, fx);
            }
        }
    }

    fn finish(&mut self, winner: Side, reason: EndReason, now: u64, fx: &mut Vec<Effect>) {
        self.phase = MatchPhase::Ended { winner, reason };
        info!(match_id = %self.id, winner = ?winner, reason = ?reason, "Match ended");

        fx.push(Effect::Publish(Outbound::all(ServerMsg::MatchEnded {
            winner,
            reason,
            score: self.score,
        })));
        self.push_snapshot(now, fx);

        let loser = winner.other();
        fx.push(Effect::Concluded(MatchOutcome {
            match_id: self.id.clone(),
            winner,
            reason,
            winner_id: self.players.get(winner).player_id.clone(),
            winner_alias: self.players.get(winner).alias.clone(),
            loser_id: self.players.get(loser).player_id.clone(),
            loser_alias: self.players.get(loser).alias.clone(),
        }));
    }

    // ------------------------------------------------------------------
    // Rematch
    // ------------------------------------------------------------------

    fn apply_rematch(&mut self, outcome: RematchOutcome, fx: &mut Vec<Effect>) {
        match outcome {
            RematchOutcome::Ignored | RematchOutcome::Pending => {}
            RematchOutcome::Offered(offer) => {
                info!(match_id = %self.id, from = ?offer.from, "Rematch requested");
                fx.push(Effect::Publish(Outbound::to(
                    offer.from.other(),
                    ServerMsg::Event {
                        event: GameEvent::RematchRequested {
                            from: offer.from,
                            alias: offer.alias,
                            expires_at: offer.expires_at,
                        },
                    },
                )));
            }
            RematchOutcome::Declined { by, offer } => {
                fx.push(Effect::Publish(Outbound::to(
                    offer.from,
                    ServerMsg::Event {
                        event: GameEvent::RematchDeclined { by },
                    },
                )));
            }
            RematchOutcome::Stale { offer } => {
                debug!(match_id = %self.id, from = ?offer.from, "Dropping stale rematch answer");
            }
            RematchOutcome::StartFresh { accepted_by, .. } => {
                let plan = self.rematch_plan(Uuid::new_v4().to_string());
                let match_id = plan.match_id.clone();
                info!(match_id = %self.id, rematch_id = %match_id, "Rematch accepted");
                self.push_event(GameEvent::RematchAccepted { by: accepted_by }, fx);
                fx.push(Effect::SpawnRematch(plan));
                fx.push(Effect::Publish(Outbound::all(ServerMsg::RematchRedirect { match_id })));
            }
            RematchOutcome::StakeRequired {
                requested_by,
                accepted_by,
            } => {
                info!(match_id = %self.id, "Staked rematch accepted, waiting for new stake");
                self.push_event(GameEvent::RematchAccepted { by: accepted_by }, fx);
                let stake = &self.config.stake;
                fx.push(Effect::Publish(Outbound::all(ServerMsg::RematchBlockchainRequired {
                    requested_by,
                    staked: stake.staked,
                    amount: stake.amount.clone(),
                    token: stake.token.clone(),
                    goal_target: self.config.goal_target,
                    duration_secs: self.config.duration_ms.map(|ms| ms / 1_000),
                })));
            }
            RematchOutcome::Ready { match_id } => {
                info!(match_id = %self.id, rematch_id = %match_id, "Staked rematch confirmed");
                fx.push(Effect::SpawnRematch(self.rematch_plan(match_id.clone())));
                fx.push(Effect::Publish(Outbound::all(ServerMsg::RematchBlockchainReady {
                    match_id,
                })));
            }
        }
    }

    fn rematch_plan(&self, match_id: String) -> RematchPlan {
        RematchPlan {
            match_id,
            config: self.config.clone(),
            players: SidePair::new(
                PlayerSlot {
                    connections: 0,
                    ..self.players.creator.clone()
                },
                PlayerSlot {
                    connections: 0,
                    ..self.players.challenger.clone()
                },
            ),
        }
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    fn push_snapshot(&self, now: u64, fx: &mut Vec<Effect>) {
        fx.push(Effect::Publish(Outbound::all(ServerMsg::Snapshot(build_snapshot(
            self, now,
        )))));
    }

    fn push_event(&self, event: GameEvent, fx: &mut Vec<Effect>) {
        fx.push(Effect::Publish(Outbound::all(ServerMsg::Event { event })));
    }
}

/// Starting positions: creator defends the bottom goal, challenger the top
fn formation(field: &Field) -> (Vec<Entity>, Entity) {
    let layout = [(0.5, 0.80), (0.28, 0.66), (0.72, 0.66)];
    let mut discs = Vec::with_capacity((DISCS_PER_SIDE * 2) as usize);

    for (i, (fx, fy)) in layout.iter().enumerate() {
        let pos = Vec2::new(field.width * fx, field.height * fy);
        discs.push(Entity::disc(
            1 + i as u32,
            Side::Creator,
            team_colors(Side::Creator),
            pos,
        ));
    }
    for (i, (fx, fy)) in layout.iter().enumerate() {
        let pos = Vec2::new(field.width * fx, field.height * (1.0 - fy));
        discs.push(Entity::disc(
            1 + DISCS_PER_SIDE + i as u32,
            Side::Challenger,
            team_colors(Side::Challenger),
            pos,
        ));
    }

    (discs, Entity::ball(BALL_ID, field.center()))
}

fn team_colors(side: Side) -> ColorPair {
    let (primary, secondary) = match side {
        Side::Creator => ("#1e88e5", "#ffffff"),
        Side::Challenger => ("#e53935", "#ffffff"),
    };
    ColorPair {
        primary: primary.to_string(),
        secondary: secondary.to_string(),
    }
}
