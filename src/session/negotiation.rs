//! Negotiation ordering
//!
//! A small signaling state machine per connection. Legality of each step is
//! checked before the engine is touched and committed only after the engine
//! call resolves, so a failed engine round-trip never leaves a half-applied
//! transition. SDP-level legality stays with the engine; this layer only
//! guarantees the engine is never called out of order.

use super::SessionError;
use crate::engine::SdpKind;

/// Signaling state of the connection.
///
/// `Stable` covers both the fresh connection and the settled state after a
/// completed exchange; renegotiation starts a new cycle from there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

#[derive(Debug)]
pub struct Negotiation {
    state: SignalingState,
}

impl Negotiation {
    pub fn new() -> Self {
        Self { state: SignalingState::Stable }
    }

    pub fn state(&self) -> SignalingState {
        self.state
    }

    /// May a local offer be generated now?
    pub fn check_offer(&self) -> Result<(), SessionError> {
        match self.state {
            SignalingState::Stable => Ok(()),
            state => Err(SessionError::InvalidState(format!(
                "cannot create offer in state {:?}",
                state
            ))),
        }
    }

    /// Commit a locally-applied offer.
    pub fn offer_applied(&mut self) {
        self.state = SignalingState::HaveLocalOffer;
    }

    /// May a local answer be generated now?
    pub fn check_answer(&self) -> Result<(), SessionError> {
        match self.state {
            SignalingState::HaveRemoteOffer => Ok(()),
            state => Err(SessionError::InvalidState(format!(
                "cannot create answer in state {:?} (no remote offer applied)",
                state
            ))),
        }
    }

    /// Commit a locally-applied answer; the exchange is complete.
    pub fn answer_applied(&mut self) {
        self.state = SignalingState::Stable;
    }

    /// May a remote description of the given kind be applied now?
    pub fn check_remote(&self, kind: SdpKind) -> Result<(), SessionError> {
        match (kind, self.state) {
            (SdpKind::Offer, SignalingState::Stable) => Ok(()),
            (SdpKind::Answer, SignalingState::HaveLocalOffer) => Ok(()),
            (kind, state) => Err(SessionError::InvalidState(format!(
                "cannot apply remote {} in state {:?}",
                kind.as_str(),
                state
            ))),
        }
    }

    /// Commit an applied remote description.
    pub fn remote_applied(&mut self, kind: SdpKind) {
        self.state = match kind {
            SdpKind::Offer => SignalingState::HaveRemoteOffer,
            SdpKind::Answer => SignalingState::Stable,
        };
    }
}

impl Default for Negotiation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiator_path_reaches_stable() {
        let mut negotiation = Negotiation::new();

        negotiation.check_offer().unwrap();
        negotiation.offer_applied();
        assert_eq!(negotiation.state(), SignalingState::HaveLocalOffer);

        negotiation.check_remote(SdpKind::Answer).unwrap();
        negotiation.remote_applied(SdpKind::Answer);
        assert_eq!(negotiation.state(), SignalingState::Stable);
    }

    #[test]
    fn responder_path_reaches_stable() {
        let mut negotiation = Negotiation::new();

        negotiation.check_remote(SdpKind::Offer).unwrap();
        negotiation.remote_applied(SdpKind::Offer);
        assert_eq!(negotiation.state(), SignalingState::HaveRemoteOffer);

        negotiation.check_answer().unwrap();
        negotiation.answer_applied();
        assert_eq!(negotiation.state(), SignalingState::Stable);
    }

    #[test]
    fn answer_without_remote_offer_is_invalid() {
        let negotiation = Negotiation::new();
        assert!(matches!(
            negotiation.check_answer(),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn double_offer_is_invalid() {
        let mut negotiation = Negotiation::new();
        negotiation.offer_applied();
        assert!(matches!(
            negotiation.check_offer(),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn remote_answer_without_local_offer_is_invalid() {
        let negotiation = Negotiation::new();
        assert!(matches!(
            negotiation.check_remote(SdpKind::Answer),
            Err(SessionError::InvalidState(_))
        ));
    }

    #[test]
    fn stable_accepts_a_fresh_cycle() {
        let mut negotiation = Negotiation::new();
        negotiation.offer_applied();
        negotiation.remote_applied(SdpKind::Answer);

        // Renegotiation: the settled connection starts over
        negotiation.check_offer().unwrap();
        negotiation.check_remote(SdpKind::Offer).unwrap();
    }
}
