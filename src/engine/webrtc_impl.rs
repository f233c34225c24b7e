//! Engine adapter backed by webrtc-rs
//!
//! Maps the capability traits onto RTCPeerConnection: callback wiring into
//! the connection's event channel, data channel I/O, and audio senders whose
//! enablement toggles via track replacement.

use super::{
    ConnectionRequest, ConnectionState, EngineConnection, EngineDataChannel, EngineEvent,
    IceCandidate, MediaKind, MediaSender, RtcEngine, SdpKind, SessionDescription,
};
use crate::session::SessionError;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Engine factory over the webrtc-rs stack.
#[derive(Default)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    async fn create_connection(
        &self,
        request: &ConnectionRequest,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Result<Arc<dyn EngineConnection>, SessionError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_err)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(engine_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = request
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(engine_err)?,
        );

        if request.continual_gathering {
            debug!("Continual gathering requested; webrtc-rs gathers per negotiation cycle");
        }

        let connection = Arc::new(WebRtcConnection {
            peer_connection,
            events,
            remote_description_set: AtomicBool::new(false),
            pending_candidates: Mutex::new(Vec::new()),
            audio_senders: Mutex::new(Vec::new()),
        });
        connection.wire_callbacks();

        Ok(connection)
    }
}

struct WebRtcConnection {
    peer_connection: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<EngineEvent>,
    /// Candidates received before the remote description buffer here
    remote_description_set: AtomicBool,
    pending_candidates: Mutex<Vec<IceCandidate>>,
    audio_senders: Mutex<Vec<Arc<WebRtcAudioSender>>>,
}

impl WebRtcConnection {
    fn wire_callbacks(&self) {
        let events = self.events.clone();
        self.peer_connection
            .on_ice_candidate(Box::new(move |candidate| {
                let events = events.clone();
                Box::pin(async move {
                    if let Some(candidate) = candidate {
                        match candidate.to_json() {
                            Ok(init) => {
                                let _ = events.send(EngineEvent::CandidateDiscovered(IceCandidate {
                                    candidate: init.candidate,
                                    sdp_mid: init.sdp_mid,
                                    sdp_mline_index: init.sdp_mline_index,
                                }));
                            }
                            Err(e) => warn!("Failed to serialize ICE candidate: {}", e),
                        }
                    }
                })
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_peer_connection_state_change(Box::new(move |state| {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(EngineEvent::ConnectionStateChanged(map_state(state)));
                })
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_negotiation_needed(Box::new(move || {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(EngineEvent::RenegotiationNeeded);
                })
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_track(Box::new(move |track, _receiver, _transceiver| {
                let events = events.clone();
                Box::pin(async move {
                    let _ = events.send(EngineEvent::RemoteStreamAdded {
                        id: track.ssrc().to_string(),
                    });
                })
            }));

        let events = self.events.clone();
        self.peer_connection
            .on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    announce_channel(channel, events);
                })
            }));
    }
}

/// Wire a channel's message stream into the event channel and report it as
/// open once its handshake completes.
fn announce_channel(channel: Arc<RTCDataChannel>, events: mpsc::UnboundedSender<EngineEvent>) {
    let label = channel.label().to_string();

    let message_events = events.clone();
    let message_label = label.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let _ = message_events.send(EngineEvent::DataReceived {
            label: message_label.clone(),
            payload: message.data.clone(),
        });
        Box::pin(async move {})
    }));

    let handle: Arc<dyn EngineDataChannel> = Arc::new(WebRtcDataChannel {
        label: label.clone(),
        channel: channel.clone(),
    });
    channel.on_open(Box::new(move || {
        let _ = events.send(EngineEvent::DataChannelOpened {
            label,
            channel: handle,
        });
        Box::pin(async move {})
    }));
}

#[async_trait]
impl EngineConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(engine_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(engine_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_local_description(desc)
            .await
            .map_err(engine_err)
    }

    async fn set_remote_description(&self, desc: &SessionDescription) -> Result<(), SessionError> {
        let desc = to_rtc_description(desc)?;
        self.peer_connection
            .set_remote_description(desc)
            .await
            .map_err(engine_err)?;

        self.remote_description_set.store(true, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending_candidates.lock());
        for candidate in pending {
            apply_candidate(self.peer_connection.clone(), candidate).await;
        }
        Ok(())
    }

    fn add_remote_candidate(&self, candidate: IceCandidate) {
        if !self.remote_description_set.load(Ordering::SeqCst) {
            self.pending_candidates.lock().push(candidate);
            return;
        }
        let peer_connection = self.peer_connection.clone();
        tokio::spawn(async move {
            apply_candidate(peer_connection, candidate).await;
        });
    }

    async fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Arc<dyn EngineDataChannel>, SessionError> {
        let channel = self
            .peer_connection
            .create_data_channel(label, None)
            .await
            .map_err(engine_err)?;

        announce_channel(channel.clone(), self.events.clone());

        Ok(Arc::new(WebRtcDataChannel {
            label: label.to_string(),
            channel,
        }))
    }

    async fn add_audio_track(&self) -> Result<(), SessionError> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", uuid::Uuid::new_v4()),
            "peerlink-audio".to_string(),
        ));

        let sender = self
            .peer_connection
            .add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_err)?;

        self.audio_senders.lock().push(Arc::new(WebRtcAudioSender {
            sender,
            track,
            enabled: AtomicBool::new(true),
        }));
        Ok(())
    }

    fn senders(&self) -> Vec<Arc<dyn MediaSender>> {
        self.audio_senders
            .lock()
            .iter()
            .map(|sender| sender.clone() as Arc<dyn MediaSender>)
            .collect()
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.peer_connection.close().await.map_err(engine_err)
    }
}

struct WebRtcDataChannel {
    label: String,
    channel: Arc<RTCDataChannel>,
}

impl EngineDataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn send(&self, payload: &[u8]) {
        let channel = self.channel.clone();
        let payload = Bytes::copy_from_slice(payload);
        tokio::spawn(async move {
            if let Err(e) = channel.send(&payload).await {
                debug!("Data channel send failed: {}", e);
            }
        });
    }

    fn close(&self) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.close().await {
                debug!("Data channel close failed: {}", e);
            }
        });
    }
}

/// Outbound audio sender. Disabling replaces the sender's track with none;
/// enabling restores the original track.
struct WebRtcAudioSender {
    sender: Arc<RTCRtpSender>,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
}

impl MediaSender for WebRtcAudioSender {
    fn kind(&self) -> MediaKind {
        MediaKind::Audio
    }

    fn set_enabled(&self, enabled: bool) {
        if self.enabled.swap(enabled, Ordering::SeqCst) == enabled {
            return;
        }
        let sender = self.sender.clone();
        let replacement = if enabled {
            Some(self.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
        } else {
            None
        };
        tokio::spawn(async move {
            if let Err(e) = sender.replace_track(replacement).await {
                warn!("Failed to toggle audio track: {}", e);
            }
        });
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

async fn apply_candidate(peer_connection: Arc<RTCPeerConnection>, candidate: IceCandidate) {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    };
    if let Err(e) = peer_connection.add_ice_candidate(init).await {
        warn!("Failed to add ICE candidate: {}", e);
    }
}

fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription, SessionError> {
    let converted = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp.clone()),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp.clone()),
    };
    converted.map_err(|e| {
        SessionError::Engine(format!("Invalid {} description: {}", desc.kind.as_str(), e))
    })
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn engine_err(e: impl std::fmt::Display) -> SessionError {
    SessionError::Engine(e.to_string())
}
