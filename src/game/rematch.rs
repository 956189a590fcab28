//! Rematch handshake layered on a finished match

use crate::ws::protocol::{Side, SidePair};

/// An open rematch request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RematchOffer {
    pub from: Side,
    pub alias: Option<String>,
    /// Unix ms after which answers are stale
    pub expires_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RematchState {
    Idle,
    Offered(RematchOffer),
    /// Staked rematch accepted; waiting for both sides to report the new match
    AwaitingStake {
        requested_by: Side,
        confirmations: SidePair<Option<String>>,
    },
    /// A rematch has been arranged, nothing more to negotiate
    Settled,
}

/// Result of feeding one action into the negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RematchOutcome {
    /// Nothing happened (wrong phase, wrong side, duplicate)
    Ignored,
    Offered(RematchOffer),
    Declined { by: Side, offer: RematchOffer },
    /// The answer arrived after the offer lapsed
    Stale { offer: RematchOffer },
    /// Unstaked: start a fresh session right away
    StartFresh { requested_by: Side, accepted_by: Side },
    /// Staked: clients must create a new on-chain match
    StakeRequired { requested_by: Side, accepted_by: Side },
    /// One confirmation recorded, waiting for the other
    Pending,
    /// Both sides confirmed the same new match
    Ready { match_id: String },
}

#[derive(Debug, Clone)]
pub struct RematchNegotiation {
    state: RematchState,
    window_ms: u64,
}

impl RematchNegotiation {
    pub fn new(window_ms: u64) -> Self {
        Self {
            state: RematchState::Idle,
            window_ms,
        }
    }

    /// Open an offer. If the counterpart already has a live offer out, this
    /// counts as accepting it.
    pub fn request(&mut self, side: Side, alias: Option<String>, now: u64, staked: bool) -> RematchOutcome {
        match &self.state {
            RematchState::Offered(offer) if offer.expires_at > now => {
                if offer.from == side {
                    RematchOutcome::Ignored
                } else {
                    self.respond(side, true, now, staked)
                }
            }
            RematchState::Idle | RematchState::Offered(_) => {
                let offer = RematchOffer {
                    from: side,
                    alias,
                    expires_at: now + self.window_ms,
                };
                self.state = RematchState::Offered(offer.clone());
                RematchOutcome::Offered(offer)
            }
            RematchState::AwaitingStake { .. } | RematchState::Settled => RematchOutcome::Ignored,
        }
    }

    /// Accept or decline the counterpart's offer
    pub fn respond(&mut self, side: Side, accept: bool, now: u64, staked: bool) -> RematchOutcome {
        let offer = match &self.state {
            RematchState::Offered(offer) if offer.from != side => offer.clone(),
            _ => return RematchOutcome::Ignored,
        };

        if offer.expires_at <= now {
            self.state = RematchState::Idle;
            return RematchOutcome::Stale { offer };
        }

        if !accept {
            self.state = RematchState::Idle;
            return RematchOutcome::Declined { by: side, offer };
        }

        if staked {
            self.state = RematchState::AwaitingStake {
                requested_by: offer.from,
                confirmations: SidePair::default(),
            };
            RematchOutcome::StakeRequired {
                requested_by: offer.from,
                accepted_by: side,
            }
        } else {
            self.state = RematchState::Settled;
            RematchOutcome::StartFresh {
                requested_by: offer.from,
                accepted_by: side,
            }
        }
    }

    /// Record which new match a side ended up in after a staked rematch
    pub fn confirm(&mut self, side: Side, match_id: String) -> RematchOutcome {
        let RematchState::AwaitingStake { confirmations, .. } = &mut self.state else {
            return RematchOutcome::Ignored;
        };

        *confirmations.get_mut(side) = Some(match_id);

        let agreed = match (&confirmations.creator, &confirmations.challenger) {
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            _ => None,
        };

        match agreed {
            Some(match_id) => {
                self.state = RematchState::Settled;
                RematchOutcome::Ready { match_id }
            }
            None => RematchOutcome::Pending,
        }
    }

    /// Drop the offer if its window has passed
    pub fn expire(&mut self, now: u64) -> Option<RematchOffer> {
        match &self.state {
            RematchState::Offered(offer) if offer.expires_at <= now => {
                let offer = offer.clone();
                self.state = RematchState::Idle;
                Some(offer)
            }
            _ => None,
        }
    }

    /// When the pending offer lapses, if any
    pub fn next_expiry(&self) -> Option<u64> {
        match &self.state {
            RematchState::Offered(offer) => Some(offer.expires_at),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn pending_offer(&self) -> Option<&RematchOffer> {
        match &self.state {
            RematchState::Offered(offer) => Some(offer),
            _ => None,
        }
    }

    #[cfg(test)]
    pub fn is_settled(&self) -> bool {
        self.state == RematchState::Settled
    }
}
