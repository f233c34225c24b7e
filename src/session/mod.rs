//! Peer session core
//!
//! This module provides the session-level view of one peer connection:
//! - Negotiation ordering (offer/answer/remote description)
//! - Data channel bookkeeping and message routing
//! - Translation of engine events into caller-visible events

pub mod channel;
pub mod negotiation;
pub mod peer;

pub use channel::ChannelRegistry;
pub use negotiation::SignalingState;
pub use peer::{PeerSession, SessionObserver};

use std::error::Error;
use std::fmt;

/// Which side of the session this peer plays.
///
/// Fixed at session creation. The Initiator eagerly opens the default
/// outbound data channel; the Responder waits for the remote offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Session-level errors
#[derive(Debug)]
pub enum SessionError {
    /// The underlying engine reported a failure; propagated verbatim
    Engine(String),
    /// Data channel creation failed (non-fatal, session continues)
    ChannelCreation(String),
    /// Operation invoked out of order relative to the negotiation state
    InvalidState(String),
    /// Platform audio route reconfiguration failed (diagnostic only)
    AudioRoute(String),
    /// Configuration load or parse failure
    Config(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Engine(msg) => write!(f, "Engine error: {}", msg),
            SessionError::ChannelCreation(msg) => write!(f, "Channel creation failed: {}", msg),
            SessionError::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            SessionError::AudioRoute(msg) => write!(f, "Audio route error: {}", msg),
            SessionError::Config(msg) => write!(f, "Config error: {}", msg),
        }
    }
}

impl Error for SessionError {}
