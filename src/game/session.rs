//! Session actors and the store that owns their handles
//!
//! Each match runs as one task that alone mutates its [`MatchState`]. Commands,
//! simulation ticks and timers are all multiplexed inside that task.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::rating::RatingStore;
use crate::util::time::{millis_until, tick_duration, unix_millis};
use crate::ws::protocol::{MatchSettings, PhaseName, Side, SidePair};

use super::r#match::{Effect, MatchConfig, MatchEvent, MatchState, MatchTimings, RematchPlan};
use super::Outbound;

/// What the lobby and health endpoints can see of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub match_id: String,
    pub phase: PhaseName,
    pub connected: SidePair<bool>,
    pub aliases: SidePair<Option<String>>,
    pub goal_target: u32,
    pub timed: bool,
    pub staked: bool,
}

impl SessionSummary {
    fn of(state: &MatchState) -> Self {
        Self {
            match_id: state.id.clone(),
            phase: state.phase.name(),
            connected: state.connected(),
            aliases: SidePair::new(
                state.players.creator.alias.clone(),
                state.players.challenger.alias.clone(),
            ),
            goal_target: state.config.goal_target,
            timed: state.config.is_timed(),
            staked: state.config.stake.staked,
        }
    }

    /// Open for a challenger: not over and exactly one side present
    pub fn waiting_side(&self) -> Option<Side> {
        if self.phase == PhaseName::Ended {
            return None;
        }
        match (self.connected.creator, self.connected.challenger) {
            (true, false) => Some(Side::Challenger),
            (false, true) => Some(Side::Creator),
            _ => None,
        }
    }
}

/// Lobby listing row
#[derive(Debug, Clone, Serialize)]
pub struct LobbyEntry {
    pub match_id: String,
    pub waiting_side: Side,
    pub alias: Option<String>,
    pub goal_target: u32,
    pub timed: bool,
    pub staked: bool,
}

/// Handle to a running session
#[derive(Clone)]
pub struct MatchHandle {
    pub id: String,
    instance: Uuid,
    pub command_tx: mpsc::Sender<MatchEvent>,
    pub outbound_tx: broadcast::Sender<Outbound>,
    summary: Arc<RwLock<SessionSummary>>,
}

impl MatchHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.outbound_tx.subscribe()
    }

    pub fn summary(&self) -> SessionSummary {
        self.summary.read().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

/// Registry of all live sessions
pub struct SessionStore {
    sessions: DashMap<String, MatchHandle>,
    ratings: Arc<RatingStore>,
    engine: EngineConfig,
}

impl SessionStore {
    pub fn new(ratings: Arc<RatingStore>, engine: EngineConfig) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            ratings,
            engine,
        })
    }

    fn timings(&self) -> MatchTimings {
        MatchTimings {
            turn_ms: self.engine.turn_timeout.as_millis() as u64,
            rematch_window_ms: self.engine.rematch_window.as_millis() as u64,
        }
    }

    pub fn get(&self, id: &str) -> Option<MatchHandle> {
        self.sessions.get(id).map(|h| h.value().clone())
    }

    /// Subscribe to a session, creating it with `settings` if needed, and
    /// queue `event` for it.
    ///
    /// The event is queued while the store entry is held, so a session that
    /// is retiring for idleness either sees it or has already left the store.
    pub async fn attach(
        self: &Arc<Self>,
        id: &str,
        settings: Option<&MatchSettings>,
        event: MatchEvent,
    ) -> Option<(MatchHandle, broadcast::Receiver<Outbound>)> {
        let (handle, rx, overflow) = {
            let mut entry = self
                .sessions
                .entry(id.to_string())
                .or_insert_with(|| self.start(self.fresh_state(id, settings)));
            if entry.is_closed() {
                debug!(match_id = %id, "Session task gone, respawning");
                *entry = self.start(self.fresh_state(id, settings));
            }

            let handle = entry.value().clone();
            let rx = handle.subscribe();
            match handle.command_tx.try_send(event) {
                Ok(()) => (handle, rx, None),
                Err(mpsc::error::TrySendError::Full(event)) => (handle, rx, Some(event)),
                Err(mpsc::error::TrySendError::Closed(event)) => {
                    let fresh = self.start(self.fresh_state(id, settings));
                    *entry = fresh.clone();
                    let rx = fresh.subscribe();
                    fresh.command_tx.try_send(event).ok()?;
                    (fresh, rx, None)
                }
            }
        };

        // A full queue means the session is busy, not retiring
        if let Some(event) = overflow {
            handle.command_tx.send(event).await.ok()?;
        }
        Some((handle, rx))
    }

    fn fresh_state(&self, id: &str, settings: Option<&MatchSettings>) -> MatchState {
        MatchState::new(id, MatchConfig::from_settings(settings), self.timings())
    }

    /// Pre-create the follow-up session of a rematch
    pub fn spawn_rematch(self: &Arc<Self>, plan: RematchPlan) {
        let id = plan.match_id.clone();
        match self.sessions.entry(id.clone()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => {
                warn!(match_id = %id, "Rematch session already exists");
            }
            Entry::Occupied(mut entry) => {
                entry.insert(self.start(MatchState::from_plan(plan, self.timings())));
            }
            Entry::Vacant(entry) => {
                entry.insert(self.start(MatchState::from_plan(plan, self.timings())));
            }
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions waiting for an opponent
    pub fn open_matches(&self) -> Vec<LobbyEntry> {
        let mut open: Vec<LobbyEntry> = self
            .sessions
            .iter()
            .filter_map(|entry| {
                let summary = entry.value().summary();
                let waiting_side = summary.waiting_side()?;
                Some(LobbyEntry {
                    alias: summary.aliases.get(waiting_side.other()).clone(),
                    match_id: summary.match_id,
                    waiting_side,
                    goal_target: summary.goal_target,
                    timed: summary.timed,
                    staked: summary.staked,
                })
            })
            .collect();
        open.sort_by(|a, b| a.match_id.cmp(&b.match_id));
        open
    }

    fn remove_instance(&self, id: &str, instance: Uuid) {
        self.sessions.remove_if(id, |_, h| h.instance == instance);
    }

    /// Spawn the task for `state` and return its handle
    fn start(self: &Arc<Self>, state: MatchState) -> MatchHandle {
        let (handle, game_match) = self.assemble(state);
        let id = handle.id.clone();
        let instance = handle.instance;

        let store = self.clone();
        tokio::spawn(async move {
            game_match.run().await;
            store.remove_instance(&id, instance);
            info!(match_id = %id, "Session removed from store");
        });

        info!(match_id = %handle.id, "Session created");
        handle
    }

    fn assemble(self: &Arc<Self>, state: MatchState) -> (MatchHandle, GameMatch) {
        let (command_tx, command_rx) = mpsc::channel(256);
        let (outbound_tx, _) = broadcast::channel(256);
        let summary = Arc::new(RwLock::new(SessionSummary::of(&state)));
        let instance = Uuid::new_v4();

        let handle = MatchHandle {
            id: state.id.clone(),
            instance,
            command_tx,
            outbound_tx: outbound_tx.clone(),
            summary: summary.clone(),
        };

        let game_match = GameMatch {
            state,
            instance,
            command_rx,
            outbound_tx,
            summary,
            store: self.clone(),
            idle_timeout: self.engine.session_idle,
        };

        (handle, game_match)
    }
}

/// The single writer of one session
struct GameMatch {
    state: MatchState,
    instance: Uuid,
    command_rx: mpsc::Receiver<MatchEvent>,
    outbound_tx: broadcast::Sender<Outbound>,
    summary: Arc<RwLock<SessionSummary>>,
    store: Arc<SessionStore>,
    idle_timeout: Duration,
}

impl GameMatch {
    /// Run until nobody has been connected for the idle timeout
    async fn run(mut self) {
        let mut ticker = interval(tick_duration());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut idle_since = (!self.state.anyone_connected()).then(Instant::now);
        let mut was_simulating = false;

        loop {
            let simulating = self.state.is_simulating();
            if simulating && !was_simulating {
                ticker.reset();
            }
            was_simulating = simulating;

            let wake = self
                .state
                .next_wake()
                .map(|at| Instant::now() + millis_until(at, unix_millis()));
            let idle_deadline = idle_since.map(|since| since + self.idle_timeout);

            let event = tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(event) => event,
                    None => break,
                },
                _ = ticker.tick(), if simulating => MatchEvent::Tick,
                _ = sleep_until(wake.unwrap_or_else(Instant::now)), if wake.is_some() => MatchEvent::Timer,
                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    match self.retire() {
                        Some(event) => event,
                        None => {
                            info!(match_id = %self.state.id, "Session idle, shutting down");
                            break;
                        }
                    }
                }
            };

            let effects = self.state.apply(event, unix_millis());
            self.dispatch(effects);
            *self.summary.write() = SessionSummary::of(&self.state);

            idle_since = if self.state.anyone_connected() {
                None
            } else {
                idle_since.or_else(|| Some(Instant::now()))
            };
        }
    }

    /// Leave the store unless a command slipped in first, in which case it
    /// is returned and the session keeps running
    fn retire(&mut self) -> Option<MatchEvent> {
        let instance = self.instance;
        let command_rx = &mut self.command_rx;
        let mut pending = None;

        self.store.sessions.remove_if(&self.state.id, |_, handle| {
            if handle.instance != instance {
                return false;
            }
            match command_rx.try_recv() {
                Ok(event) => {
                    pending = Some(event);
                    false
                }
                Err(_) => true,
            }
        });

        pending
    }

    fn dispatch(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Publish(outbound) => {
                    // No subscribers is fine
                    let _ = self.outbound_tx.send(outbound);
                }
                Effect::Concluded(outcome) => {
                    let ratings = self.store.ratings.clone();
                    tokio::task::spawn_blocking(move || {
                        ratings.record_result(&outcome);
                    });
                }
                Effect::SpawnRematch(plan) => self.store.spawn_rematch(plan),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RatingConfig;
    use crate::ws::protocol::{GameEvent, ServerMsg};
    use tokio::time::timeout;

    fn engine(turn_ms: u64, idle_ms: u64) -> EngineConfig {
        EngineConfig {
            turn_timeout: Duration::from_millis(turn_ms),
            rematch_window: Duration::from_secs(30),
            session_idle: Duration::from_millis(idle_ms),
        }
    }

    fn ratings() -> Arc<RatingStore> {
        let path = std::env::temp_dir()
            .join(format!("disc-duel-session-{}", Uuid::new_v4()))
            .join("ledger.json");
        Arc::new(RatingStore::load(path, RatingConfig::default()))
    }

    fn join(side: Side) -> MatchEvent {
        MatchEvent::Join {
            side,
            player_id: Some(format!("{:?}", side).to_lowercase()),
            alias: Some(format!("{:?}", side)),
        }
    }

    /// Wait for the first message matching `pred`
    async fn wait_for<F>(rx: &mut broadcast::Receiver<Outbound>, mut pred: F) -> ServerMsg
    where
        F: FnMut(&ServerMsg) -> bool,
    {
        timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(out) if pred(&out.msg) => return out.msg,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("session closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for message")
    }

    #[tokio::test]
    async fn test_match_starts_when_both_sides_join() {
        let store = SessionStore::new(ratings(), engine(20_000, 60_000));
        let (_, mut rx) = store.attach("m-1", None, join(Side::Creator)).await.unwrap();
        store.attach("m-1", None, join(Side::Challenger)).await.unwrap();

        let msg = wait_for(&mut rx, |m| {
            matches!(m, ServerMsg::Snapshot(s) if s.phase == PhaseName::AwaitingInput)
        })
        .await;
        if let ServerMsg::Snapshot(snapshot) = msg {
            assert_eq!(snapshot.active, Side::Creator);
            assert!(snapshot.turn_deadline.is_some());
        }
        assert_eq!(store.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_flick_simulates_then_hands_over() {
        let store = SessionStore::new(ratings(), engine(20_000, 60_000));
        let (handle, mut rx) = store.attach("m-2", None, join(Side::Creator)).await.unwrap();
        store.attach("m-2", None, join(Side::Challenger)).await.unwrap();

        handle
            .command_tx
            .send(MatchEvent::Input {
                side: Side::Creator,
                entity_id: 1,
                dx: 0.5,
                dy: 0.0,
            })
            .await
            .unwrap();

        wait_for(&mut rx, |m| matches!(m, ServerMsg::Snapshot(s) if s.phase == PhaseName::Simulating)).await;
        let msg = wait_for(&mut rx, |m| {
            matches!(m, ServerMsg::Snapshot(s) if s.phase == PhaseName::AwaitingInput)
        })
        .await;
        if let ServerMsg::Snapshot(snapshot) = msg {
            assert_eq!(snapshot.active, Side::Challenger);
            assert!(!snapshot.kickoff);
        }
    }

    #[tokio::test]
    async fn test_lobby_lists_half_full_sessions() {
        let store = SessionStore::new(ratings(), engine(20_000, 60_000));
        let (_, mut rx) = store.attach("open", None, join(Side::Creator)).await.unwrap();
        wait_for(&mut rx, |m| matches!(m, ServerMsg::Snapshot(_))).await;
        // Let the summary catch up with the processed join
        tokio::time::sleep(Duration::from_millis(20)).await;

        let open = store.open_matches();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].match_id, "open");
        assert_eq!(open[0].waiting_side, Side::Challenger);
        assert_eq!(open[0].alias.as_deref(), Some("Creator"));
    }

    #[tokio::test]
    async fn test_repeated_timeouts_forfeit_and_update_ratings() {
        let ratings = ratings();
        let store = SessionStore::new(ratings.clone(), engine(40, 60_000));
        let (_, mut rx) = store.attach("m-3", None, join(Side::Creator)).await.unwrap();
        store.attach("m-3", None, join(Side::Challenger)).await.unwrap();

        let msg = wait_for(&mut rx, |m| matches!(m, ServerMsg::MatchEnded { .. })).await;
        match msg {
            ServerMsg::MatchEnded { winner, score, .. } => {
                assert_eq!(winner, Side::Challenger);
                assert_eq!(score, SidePair::new(0, 3));
            }
            other => panic!("unexpected: {:?}", other),
        }

        // Rating write happens off the session task
        timeout(Duration::from_secs(5), async {
            while ratings.rating_of("challenger") == 1000 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rating never updated");
        assert_eq!(ratings.rating_of("creator"), 984);
    }

    #[tokio::test]
    async fn test_rematch_redirects_into_prepared_session() {
        let store = SessionStore::new(ratings(), engine(40, 60_000));
        let (handle, mut rx) = store.attach("m-4", None, join(Side::Creator)).await.unwrap();
        store.attach("m-4", None, join(Side::Challenger)).await.unwrap();
        wait_for(&mut rx, |m| matches!(m, ServerMsg::MatchEnded { .. })).await;

        handle
            .command_tx
            .send(MatchEvent::RequestRematch {
                side: Side::Creator,
                alias: None,
            })
            .await
            .unwrap();
        let request = wait_for(&mut rx, |m| {
            matches!(m, ServerMsg::Event { event: GameEvent::RematchRequested { .. } })
        })
        .await;
        assert!(matches!(
            request,
            ServerMsg::Event {
                event: GameEvent::RematchRequested { from: Side::Creator, .. }
            }
        ));

        handle
            .command_tx
            .send(MatchEvent::RespondRematch {
                side: Side::Challenger,
                accept: true,
            })
            .await
            .unwrap();
        let redirect = wait_for(&mut rx, |m| matches!(m, ServerMsg::RematchRedirect { .. })).await;
        let ServerMsg::RematchRedirect { match_id } = redirect else {
            unreachable!()
        };

        let next = store.get(&match_id).expect("rematch session exists");
        let summary = next.summary();
        assert_eq!(summary.aliases.creator.as_deref(), Some("Creator"));
        assert_eq!(summary.phase, PhaseName::Paused);
    }

    #[tokio::test]
    async fn test_idle_session_is_evicted() {
        let store = SessionStore::new(ratings(), engine(20_000, 100));
        let (handle, _rx) = store.attach("gone", None, join(Side::Creator)).await.unwrap();
        handle
            .command_tx
            .send(MatchEvent::Leave { side: Side::Creator })
            .await
            .unwrap();

        timeout(Duration::from_secs(5), async {
            while store.get("gone").is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("session never evicted");
    }

    #[test]
    fn test_retire_yields_to_queued_command() {
        let store = SessionStore::new(ratings(), engine(20_000, 60_000));
        let (handle, mut game_match) = store.assemble(store.fresh_state("r-1", None));
        store.sessions.insert("r-1".into(), handle.clone());

        // A join queued just before the idle deadline keeps the session alive
        handle.command_tx.try_send(join(Side::Creator)).unwrap();
        let pending = game_match.retire();
        assert!(matches!(pending, Some(MatchEvent::Join { side: Side::Creator, .. })));
        assert!(store.get("r-1").is_some());

        assert!(game_match.retire().is_none());
        assert!(store.get("r-1").is_none());
    }

    #[test]
    fn test_retire_leaves_newer_instance_alone() {
        let store = SessionStore::new(ratings(), engine(20_000, 60_000));
        let (_, mut old) = store.assemble(store.fresh_state("r-2", None));
        let (newer, _newer_match) = store.assemble(store.fresh_state("r-2", None));
        store.sessions.insert("r-2".into(), newer.clone());

        assert!(old.retire().is_none());
        assert_eq!(store.get("r-2").map(|h| h.instance), Some(newer.instance));
    }

    #[tokio::test]
    async fn test_attach_replaces_exited_session() {
        let store = SessionStore::new(ratings(), engine(20_000, 60_000));
        let (stale, game_match) = store.assemble(store.fresh_state("r-3", None));
        store.sessions.insert("r-3".into(), stale.clone());
        drop(game_match);

        let (handle, mut rx) = store.attach("r-3", None, join(Side::Creator)).await.unwrap();
        assert_ne!(handle.instance, stale.instance);
        wait_for(&mut rx, |m| matches!(m, ServerMsg::Snapshot(_))).await;
        assert_eq!(store.get("r-3").map(|h| h.instance), Some(handle.instance));
    }
}
