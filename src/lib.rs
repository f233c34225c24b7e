//! peerlink-core - peer session core
//!
//! Engine-agnostic negotiation and data channel multiplexing for a single
//! peer's real-time transport session. The underlying ICE/DTLS/media engine
//! is consumed through the capability traits in [`engine`]; an adapter backed
//! by webrtc-rs is available behind the `webrtc-engine` feature.

pub mod audio;
pub mod config;
pub mod engine;
pub mod session;

// Re-exports
pub use audio::AudioRouter;
pub use config::{IceServerConfig, SessionConfig};
pub use engine::{
    ConnectionRequest, ConnectionState, EngineConnection, EngineDataChannel, EngineEvent,
    IceCandidate, MediaKind, MediaSender, RtcEngine, SdpKind, SessionDescription,
};
pub use session::{PeerSession, Role, SessionError, SessionObserver, SignalingState};

#[cfg(feature = "webrtc-engine")]
pub use engine::webrtc_impl::WebRtcEngine;
