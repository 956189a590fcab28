//! Turn timeout escalation

use crate::ws::protocol::{Side, SidePair};

/// Consecutive timeouts that lose the match
pub const FORFEIT_THRESHOLD: u32 = 3;

/// What to do when the active side's deadline passes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutVerdict {
    /// Someone is missing: suspend the clock, nobody is punished
    Repause,
    /// Hand the turn over without touching the board
    SkipTurn { side: Side, strikes: u32 },
    /// Too many strikes; the other side wins
    Forfeit { loser: Side, strikes: u32 },
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutPolicy {
    threshold: u32,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            threshold: FORFEIT_THRESHOLD,
        }
    }
}

impl TimeoutPolicy {
    /// Judge an elapsed deadline, bumping the strike counter when it counts
    pub fn on_deadline(
        &self,
        active: Side,
        connected: SidePair<bool>,
        strikes: &mut SidePair<u32>,
    ) -> TimeoutVerdict {
        if !(connected.creator && connected.challenger) {
            return TimeoutVerdict::Repause;
        }

        let count = strikes.get_mut(active);
        *count += 1;
        let strikes = *count;

        if strikes >= self.threshold {
            TimeoutVerdict::Forfeit {
                loser: active,
                strikes,
            }
        } else {
            TimeoutVerdict::SkipTurn {
                side: active,
                strikes,
            }
        }
    }

    /// A side moved; its own streak is broken
    pub fn on_move(&self, side: Side, strikes: &mut SidePair<u32>) {
        *strikes.get_mut(side) = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOTH: SidePair<bool> = SidePair {
        creator: true,
        challenger: true,
    };

    #[test]
    fn test_two_timeouts_never_forfeit() {
        let policy = TimeoutPolicy::default();
        let mut strikes = SidePair::default();
        for expected in 1..=2 {
            let verdict = policy.on_deadline(Side::Creator, BOTH, &mut strikes);
            assert_eq!(
                verdict,
                TimeoutVerdict::SkipTurn {
                    side: Side::Creator,
                    strikes: expected
                }
            );
        }
    }

    #[test]
    fn test_third_consecutive_timeout_forfeits() {
        let policy = TimeoutPolicy::default();
        let mut strikes = SidePair::default();
        policy.on_deadline(Side::Challenger, BOTH, &mut strikes);
        policy.on_deadline(Side::Challenger, BOTH, &mut strikes);
        let verdict = policy.on_deadline(Side::Challenger, BOTH, &mut strikes);
        assert_eq!(
            verdict,
            TimeoutVerdict::Forfeit {
                loser: Side::Challenger,
                strikes: 3
            }
        );
    }

    #[test]
    fn test_move_resets_only_own_counter() {
        let policy = TimeoutPolicy::default();
        let mut strikes = SidePair::new(2, 2);
        policy.on_move(Side::Creator, &mut strikes);
        assert_eq!(strikes, SidePair::new(0, 2));
    }

    #[test]
    fn test_missing_side_repauses_without_strike() {
        let policy = TimeoutPolicy::default();
        let mut strikes = SidePair::new(2, 0);
        let verdict = policy.on_deadline(Side::Creator, SidePair::new(true, false), &mut strikes);
        assert_eq!(verdict, TimeoutVerdict::Repause);
        assert_eq!(strikes, SidePair::new(2, 0));
    }
}
