//! Engine capability interface
//!
//! The session core never talks to a concrete ICE/DTLS/media stack. It
//! consumes the traits below and receives engine callbacks as [`EngineEvent`]
//! values on a per-connection mpsc channel. The `webrtc-engine` feature ships
//! an adapter backed by webrtc-rs; tests drive the core with a simulated
//! engine.

#[cfg(feature = "webrtc-engine")]
pub mod webrtc_impl;

use crate::config::IceServerConfig;
use crate::session::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Type tag of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

/// Opaque negotiation artifact produced by the engine.
///
/// The `sdp` blob is never interpreted here; signaling layers own its
/// transport encoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpKind::Answer, sdp: sdp.into() }
    }
}

/// One network reachability hint for the remote peer.
///
/// Field casing on the wire matches the JavaScript RTCIceCandidateInit
/// dictionary so browser peers can consume candidates unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Connection state as reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Media kind of an outbound sender's track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// Connection parameters handed to the engine.
///
/// The negotiation model and gathering policy are fixed by the session core:
/// unified negotiation and continual gathering, so network changes surface as
/// fresh candidates instead of a dead connection. Engines that cannot honor a
/// policy treat it as advisory.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub ice_servers: Vec<IceServerConfig>,
    pub unified_negotiation: bool,
    pub continual_gathering: bool,
}

impl ConnectionRequest {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self {
            ice_servers,
            unified_negotiation: true,
            continual_gathering: true,
        }
    }
}

/// Asynchronous engine callbacks, delivered on the connection's event channel.
///
/// Events may arrive on any worker at any time after connection creation, in
/// any order relative to caller-invoked operations.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A local candidate was gathered
    CandidateDiscovered(IceCandidate),
    /// Transport-level connection state changed
    ConnectionStateChanged(ConnectionState),
    /// Connection parameters changed; a fresh offer/answer cycle is needed
    RenegotiationNeeded,
    /// Remote media stream appeared (diagnostic only)
    RemoteStreamAdded { id: String },
    /// Remote media stream went away (diagnostic only)
    RemoteStreamRemoved { id: String },
    /// A data channel finished its open handshake
    DataChannelOpened {
        label: String,
        channel: Arc<dyn EngineDataChannel>,
    },
    /// Bytes arrived on a data channel
    DataReceived { label: String, payload: Bytes },
}

/// Factory for engine connections.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Instantiate one underlying connection. Engine callbacks for its whole
    /// lifetime flow through `events`; the engine drops the sender when the
    /// connection is torn down.
    async fn create_connection(
        &self,
        request: &ConnectionRequest,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn EngineConnection>, SessionError>;
}

/// One underlying peer connection.
#[async_trait]
pub trait EngineConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError>;

    async fn create_answer(&self) -> Result<SessionDescription, SessionError>;

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError>;

    /// Fire-and-forget. Candidates arriving before the remote description is
    /// set are buffered inside the engine.
    fn add_remote_candidate(&self, candidate: IceCandidate);

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn EngineDataChannel>, SessionError>;

    /// Create and attach one outbound audio track. Fires renegotiation-needed.
    async fn add_audio_track(&self) -> Result<(), SessionError>;

    /// Snapshot of the connection's outbound senders.
    fn senders(&self) -> Vec<Arc<dyn MediaSender>>;

    async fn close(&self) -> Result<(), SessionError>;
}

/// Handle to one open data channel.
///
/// Readiness is owned by the engine; a handle is only handed out (via
/// [`EngineEvent::DataChannelOpened`] or `create_data_channel`) once it can
/// accept traffic or will shortly.
pub trait EngineDataChannel: Send + Sync {
    fn label(&self) -> &str;

    /// Non-blocking send; engines with async backends queue internally.
    fn send(&self, payload: &[u8]);

    /// Non-blocking close.
    fn close(&self);
}

/// One outbound media sender on the connection.
pub trait MediaSender: Send + Sync {
    fn kind(&self) -> MediaKind;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;
}

impl std::fmt::Debug for dyn EngineDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EngineDataChannel({})", self.label())
    }
}
