//! Snapshot building for network transmission

use crate::ws::protocol::{MatchSnapshot, SidePair};

use super::r#match::{MatchPhase, MatchState};

/// Build the full observable state of a session
pub fn build_snapshot(state: &MatchState, now: u64) -> MatchSnapshot {
    let (winner, end_reason) = match state.phase {
        MatchPhase::Ended { winner, reason } => (Some(winner), Some(reason)),
        _ => (None, None),
    };

    MatchSnapshot {
        match_id: state.id.clone(),
        phase: state.phase.name(),
        active: state.active,
        turn_deadline: state.turn_deadline(),
        score: state.score,
        connected: state.connected(),
        aliases: SidePair::new(
            state.players.creator.alias.clone(),
            state.players.challenger.alias.clone(),
        ),
        timeouts: state.strikes,
        goal_target: state.config.goal_target,
        match_ends_at: state.match_ends_at,
        golden_goal: state.golden_goal,
        kickoff: state.kickoff,
        winner,
        end_reason,
        entities: state.entities().map(|e| e.to_snapshot()).collect(),
        server_time: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::r#match::{MatchConfig, MatchTimings};
    use crate::ws::protocol::{EntityKindName, PhaseName, Side};

    #[test]
    fn test_snapshot_of_fresh_match() {
        let state = MatchState::new("m-9", MatchConfig::default(), MatchTimings::default());
        let snapshot = build_snapshot(&state, 1234);

        assert_eq!(snapshot.match_id, "m-9");
        assert_eq!(snapshot.phase, PhaseName::Paused);
        assert_eq!(snapshot.turn_deadline, None);
        assert_eq!(snapshot.server_time, 1234);
        assert_eq!(snapshot.entities.len(), 7);
        assert_eq!(snapshot.entities[0].kind, EntityKindName::Ball);
        assert!(snapshot.entities[0].colors.is_none());

        let creator_discs = snapshot
            .entities
            .iter()
            .filter(|e| e.owner == Some(Side::Creator))
            .count();
        assert_eq!(creator_discs, 3);
    }

    #[test]
    fn test_snapshot_serializes_with_type_tag() {
        let state = MatchState::new("m-9", MatchConfig::default(), MatchTimings::default());
        let msg = crate::ws::protocol::ServerMsg::Snapshot(build_snapshot(&state, 0));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["phase"], "paused");
        assert_eq!(json["score"]["creator"], 0);
    }
}
