//! Peer session orchestration
//!
//! One [`PeerSession`] owns one engine connection, the data channel registry
//! and the negotiation ordering for it. Engine callbacks arrive on the
//! connection's event channel and are pumped into registry updates and
//! [`SessionObserver`] notifications.

use super::channel::ChannelRegistry;
use super::negotiation::{Negotiation, SignalingState};
use super::{Role, SessionError};
use crate::audio::{AudioRouteWorker, AudioRouter};
use crate::config::SessionConfig;
use crate::engine::{
    ConnectionRequest, ConnectionState, EngineConnection, EngineEvent, IceCandidate, MediaKind,
    RtcEngine, SessionDescription,
};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

/// Caller-facing session events.
///
/// The session holds its observer weakly: tearing the session down never
/// requires the listener to unregister first, and a dropped listener simply
/// stops receiving events.
pub trait SessionObserver: Send + Sync {
    /// A local candidate is ready for transmission to the remote peer.
    fn on_local_candidate(&self, _candidate: IceCandidate) {}

    /// Transport-level connection state changed.
    fn on_connection_state(&self, _state: ConnectionState) {}

    /// A data channel finished opening; sends to this label will now reach
    /// the remote peer.
    fn on_channel_open(&self, _label: &str) {}

    /// Bytes arrived on a data channel.
    fn on_data(&self, _label: &str, _payload: Bytes) {}

    /// Connection parameters changed; the caller should run a fresh
    /// offer/answer cycle. The session never renegotiates on its own.
    fn on_renegotiation_needed(&self) {}
}

/// State shared with the event pump task.
struct SessionShared {
    id: String,
    registry: Mutex<ChannelRegistry>,
    observer: Mutex<Option<Weak<dyn SessionObserver>>>,
}

impl SessionShared {
    fn observer(&self) -> Option<Arc<dyn SessionObserver>> {
        self.observer.lock().as_ref().and_then(Weak::upgrade)
    }
}

/// A single peer's transport session.
///
/// Created once per call, torn down explicitly with [`PeerSession::close`];
/// a closed session rejects every further operation.
pub struct PeerSession {
    role: Role,
    config: SessionConfig,
    connection: Arc<dyn EngineConnection>,
    shared: Arc<SessionShared>,
    negotiation: AsyncMutex<Negotiation>,
    closed: AtomicBool,
    audio_route: Mutex<Option<AudioRouteWorker>>,
}

impl PeerSession {
    /// Create a session and its underlying connection.
    ///
    /// The Initiator immediately opens the default outbound data channel;
    /// failure to do so is diagnostic, not fatal.
    pub async fn create(
        role: Role,
        config: SessionConfig,
        engine: Arc<dyn RtcEngine>,
    ) -> Result<Arc<Self>, SessionError> {
        let id = uuid::Uuid::new_v4().to_string();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let request = ConnectionRequest::new(config.effective_ice_servers());
        let connection = engine.create_connection(&request, events_tx).await?;

        let shared = Arc::new(SessionShared {
            id: id.clone(),
            registry: Mutex::new(ChannelRegistry::new()),
            observer: Mutex::new(None),
        });
        spawn_event_pump(shared.clone(), events_rx);

        let session = Arc::new(Self {
            role,
            config,
            connection,
            shared,
            negotiation: AsyncMutex::new(Negotiation::new()),
            closed: AtomicBool::new(false),
            audio_route: Mutex::new(None),
        });

        if role == Role::Initiator {
            let label = session.config.default_channel_label.clone();
            if let Err(e) = session.create_data_channel(&label).await {
                warn!("Session {} default channel {} not created: {}", id, label, e);
            }
        }

        info!("Created {:?} session {}", role, id);
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Register the caller's event listener. Only a weak reference is kept.
    pub fn register_observer<O>(&self, observer: &Arc<O>)
    where
        O: SessionObserver + 'static,
    {
        let observer: Arc<dyn SessionObserver> = observer.clone();
        let weak: Weak<dyn SessionObserver> = Arc::downgrade(&observer);
        *self.shared.observer.lock() = Some(weak);
    }

    /// Generate an offer and apply it as the local description.
    ///
    /// The description is only returned once its local application has
    /// resolved; a failure in either engine step surfaces here and leaves
    /// the signaling state untouched.
    pub async fn offer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;
        negotiation.check_offer()?;

        let offer = self.connection.create_offer().await?;
        self.connection.set_local_description(&offer).await?;
        negotiation.offer_applied();

        debug!("Session {} local offer applied", self.id());
        Ok(offer)
    }

    /// Generate an answer to a previously applied remote offer and apply it
    /// as the local description, completing the exchange.
    pub async fn answer(&self) -> Result<SessionDescription, SessionError> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;
        negotiation.check_answer()?;

        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(&answer).await?;
        negotiation.answer_applied();

        debug!("Session {} local answer applied", self.id());
        Ok(answer)
    }

    /// Apply a description received from the remote peer.
    pub async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut negotiation = self.negotiation.lock().await;
        negotiation.check_remote(desc.kind)?;

        self.connection.set_remote_description(&desc).await?;
        negotiation.remote_applied(desc.kind);

        debug!("Session {} remote {} applied", self.id(), desc.kind.as_str());
        Ok(())
    }

    /// Add a candidate received from the remote peer.
    ///
    /// Fire-and-forget; legal at any time after creation. The engine buffers
    /// candidates that arrive before the remote description.
    pub fn add_remote_candidate(&self, candidate: IceCandidate) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Session {} is closed, dropping remote candidate", self.id());
            return;
        }
        self.connection.add_remote_candidate(candidate);
    }

    /// Create an outbound data channel and record it in the local map.
    pub async fn create_data_channel(&self, label: &str) -> Result<(), SessionError> {
        self.ensure_open()?;
        match self.connection.create_data_channel(label).await {
            Ok(channel) => {
                self.shared.registry.lock().register_local(label, channel);
                debug!("Session {} created local channel {}", self.id(), label);
                Ok(())
            }
            Err(e) => Err(SessionError::ChannelCreation(e.to_string())),
        }
    }

    /// Send bytes on a remotely-opened channel.
    ///
    /// If no channel with this label has been reported open by the engine
    /// (or the session is closed), the bytes are dropped. Callers wait for
    /// [`SessionObserver::on_channel_open`] before sending.
    pub fn send_data(&self, label: &str, payload: &[u8]) {
        if self.closed.load(Ordering::SeqCst) {
            debug!("Session {} is closed, dropping send on {}", self.id(), label);
            return;
        }
        let channel = self.shared.registry.lock().lookup_remote(label);
        match channel {
            Some(channel) => channel.send(payload),
            None => debug!(
                "Session {} has no open channel {}, dropping {} bytes",
                self.id(),
                label,
                payload.len()
            ),
        }
    }

    /// Create and attach one outbound audio track.
    pub async fn add_audio_track(&self) -> Result<(), SessionError> {
        self.ensure_open()?;
        self.connection.add_audio_track().await
    }

    pub fn mute_audio(&self) -> Result<(), SessionError> {
        self.set_audio_enabled(false)
    }

    pub fn unmute_audio(&self) -> Result<(), SessionError> {
        self.set_audio_enabled(true)
    }

    fn set_audio_enabled(&self, enabled: bool) -> Result<(), SessionError> {
        self.ensure_open()?;
        let mut toggled = 0usize;
        for sender in self.connection.senders() {
            if sender.kind() == MediaKind::Audio {
                sender.set_enabled(enabled);
                toggled += 1;
            }
        }
        debug!(
            "Session {} set {} audio sender(s) enabled={}",
            self.id(),
            toggled,
            enabled
        );
        Ok(())
    }

    /// Install the platform audio-route hook and its worker.
    pub fn set_audio_router(&self, router: Arc<dyn AudioRouter>) {
        *self.audio_route.lock() = Some(AudioRouteWorker::spawn(router));
    }

    /// Request speaker output. Best-effort: runs on the audio route worker,
    /// failures are logged and never surfaced.
    pub fn force_speaker_routing(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match &*self.audio_route.lock() {
            Some(worker) => worker.request_speaker(),
            None => debug!("Session {} has no audio router, ignoring speaker request", self.id()),
        }
    }

    /// Tear the session down: close every channel in both maps, then the
    /// connection. Any operation after this fails with `InvalidState`,
    /// including a second `close()`.
    pub async fn close(&self) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(SessionError::InvalidState("session already closed".to_string()));
        }

        self.shared.registry.lock().close_all();
        *self.audio_route.lock() = None;
        self.connection.close().await?;

        info!("Session {} closed", self.id());
        Ok(())
    }

    pub async fn signaling_state(&self) -> SignalingState {
        self.negotiation.lock().await.state()
    }

    pub fn local_channel_count(&self) -> usize {
        self.shared.registry.lock().local_count()
    }

    pub fn remote_channel_count(&self) -> usize {
        self.shared.registry.lock().remote_count()
    }

    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::InvalidState("session is closed".to_string()));
        }
        Ok(())
    }
}

fn spawn_event_pump(shared: Arc<SessionShared>, mut events: mpsc::UnboundedReceiver<EngineEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            dispatch_engine_event(&shared, event);
        }
        debug!("Session {} engine event stream ended", shared.id);
    });
}

fn dispatch_engine_event(shared: &SessionShared, event: EngineEvent) {
    match event {
        EngineEvent::CandidateDiscovered(candidate) => {
            if let Some(observer) = shared.observer() {
                observer.on_local_candidate(candidate);
            }
        }
        EngineEvent::ConnectionStateChanged(state) => {
            info!("Session {} connection state: {:?}", shared.id, state);
            if let Some(observer) = shared.observer() {
                observer.on_connection_state(state);
            }
        }
        EngineEvent::RenegotiationNeeded => {
            if let Some(observer) = shared.observer() {
                observer.on_renegotiation_needed();
            }
        }
        EngineEvent::RemoteStreamAdded { id } => {
            debug!("Session {} remote stream added: {}", shared.id, id);
        }
        EngineEvent::RemoteStreamRemoved { id } => {
            debug!("Session {} remote stream removed: {}", shared.id, id);
        }
        EngineEvent::DataChannelOpened { label, channel } => {
            info!("Session {} data channel open: {}", shared.id, label);
            shared.registry.lock().register_remote(label.clone(), channel);
            if let Some(observer) = shared.observer() {
                observer.on_channel_open(&label);
            }
        }
        EngineEvent::DataReceived { label, payload } => {
            if let Some(observer) = shared.observer() {
                observer.on_data(&label, payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineDataChannel, MediaSender, SdpKind};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Let the spawned event pump drain pending engine events.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[derive(Default)]
    struct MockEngine {
        fail_local_description: bool,
        fail_channel_creation: bool,
        connections: Mutex<Vec<Arc<MockConnection>>>,
    }

    impl MockEngine {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn failing_local_description() -> Arc<Self> {
            Arc::new(Self {
                fail_local_description: true,
                ..Default::default()
            })
        }

        fn failing_channel_creation() -> Arc<Self> {
            Arc::new(Self {
                fail_channel_creation: true,
                ..Default::default()
            })
        }

        fn connection(&self, index: usize) -> Arc<MockConnection> {
            self.connections.lock()[index].clone()
        }
    }

    #[async_trait]
    impl RtcEngine for MockEngine {
        async fn create_connection(
            &self,
            _request: &ConnectionRequest,
            events: mpsc::UnboundedSender<EngineEvent>,
        ) -> Result<Arc<dyn EngineConnection>, SessionError> {
            let connection = Arc::new(MockConnection {
                events,
                fail_local_description: self.fail_local_description,
                fail_channel_creation: self.fail_channel_creation,
                has_remote_description: AtomicBool::new(false),
                queued_candidates: Mutex::new(Vec::new()),
                applied_candidates: Mutex::new(Vec::new()),
                channels: Mutex::new(HashMap::new()),
                senders: Mutex::new(Vec::new()),
                create_answer_calls: AtomicUsize::new(0),
                set_remote_calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            });
            self.connections.lock().push(connection.clone());
            Ok(connection)
        }
    }

    struct MockConnection {
        events: mpsc::UnboundedSender<EngineEvent>,
        fail_local_description: bool,
        fail_channel_creation: bool,
        has_remote_description: AtomicBool,
        queued_candidates: Mutex<Vec<IceCandidate>>,
        applied_candidates: Mutex<Vec<IceCandidate>>,
        channels: Mutex<HashMap<String, Arc<MockChannel>>>,
        senders: Mutex<Vec<Arc<MockSender>>>,
        create_answer_calls: AtomicUsize,
        set_remote_calls: AtomicUsize,
        closed: AtomicBool,
    }

    impl MockConnection {
        fn fire_state(&self, state: ConnectionState) {
            let _ = self
                .events
                .send(EngineEvent::ConnectionStateChanged(state));
        }

        fn fire_candidate(&self, candidate: IceCandidate) {
            let _ = self.events.send(EngineEvent::CandidateDiscovered(candidate));
        }

        fn fire_data(&self, label: &str, payload: &[u8]) {
            let _ = self.events.send(EngineEvent::DataReceived {
                label: label.to_string(),
                payload: Bytes::copy_from_slice(payload),
            });
        }

        /// Simulate the engine completing a channel open handshake.
        fn open_remote_channel(&self, label: &str) -> Arc<MockChannel> {
            let channel = Arc::new(MockChannel::new(label));
            let _ = self.events.send(EngineEvent::DataChannelOpened {
                label: label.to_string(),
                channel: channel.clone(),
            });
            channel
        }

        fn local_channel(&self, label: &str) -> Arc<MockChannel> {
            self.channels.lock()[label].clone()
        }
    }

    #[async_trait]
    impl EngineConnection for MockConnection {
        async fn create_offer(&self) -> Result<SessionDescription, SessionError> {
            Ok(SessionDescription::offer("v=0\r\nmock-offer"))
        }

        async fn create_answer(&self) -> Result<SessionDescription, SessionError> {
            self.create_answer_calls.fetch_add(1, Ordering::SeqCst);
            Ok(SessionDescription::answer("v=0\r\nmock-answer"))
        }

        async fn set_local_description(
            &self,
            _desc: &SessionDescription,
        ) -> Result<(), SessionError> {
            if self.fail_local_description {
                return Err(SessionError::Engine("local description rejected".to_string()));
            }
            Ok(())
        }

        async fn set_remote_description(
            &self,
            _desc: &SessionDescription,
        ) -> Result<(), SessionError> {
            self.set_remote_calls.fetch_add(1, Ordering::SeqCst);
            self.has_remote_description.store(true, Ordering::SeqCst);
            let queued = std::mem::take(&mut *self.queued_candidates.lock());
            self.applied_candidates.lock().extend(queued);
            Ok(())
        }

        fn add_remote_candidate(&self, candidate: IceCandidate) {
            if self.has_remote_description.load(Ordering::SeqCst) {
                self.applied_candidates.lock().push(candidate);
            } else {
                self.queued_candidates.lock().push(candidate);
            }
        }

        async fn create_data_channel(
            &self,
            label: &str,
        ) -> Result<Arc<dyn EngineDataChannel>, SessionError> {
            if self.fail_channel_creation || self.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Engine("connection cannot open channels".to_string()));
            }
            let channel = Arc::new(MockChannel::new(label));
            self.channels.lock().insert(label.to_string(), channel.clone());
            Ok(channel)
        }

        async fn add_audio_track(&self) -> Result<(), SessionError> {
            self.senders.lock().push(Arc::new(MockSender {
                kind: MediaKind::Audio,
                enabled: AtomicBool::new(true),
            }));
            let _ = self.events.send(EngineEvent::RenegotiationNeeded);
            Ok(())
        }

        fn senders(&self) -> Vec<Arc<dyn MediaSender>> {
            self.senders
                .lock()
                .iter()
                .map(|sender| sender.clone() as Arc<dyn MediaSender>)
                .collect()
        }

        async fn close(&self) -> Result<(), SessionError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockChannel {
        label: String,
        sent: Mutex<Vec<Vec<u8>>>,
        closed: AtomicBool,
    }

    impl MockChannel {
        fn new(label: &str) -> Self {
            Self {
                label: label.to_string(),
                sent: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl EngineDataChannel for MockChannel {
        fn label(&self) -> &str {
            &self.label
        }

        fn send(&self, payload: &[u8]) {
            if !self.closed.load(Ordering::SeqCst) {
                self.sent.lock().push(payload.to_vec());
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct MockSender {
        kind: MediaKind,
        enabled: AtomicBool,
    }

    impl MediaSender for MockSender {
        fn kind(&self) -> MediaKind {
            self.kind
        }

        fn set_enabled(&self, enabled: bool) {
            self.enabled.store(enabled, Ordering::SeqCst);
        }

        fn is_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<ConnectionState>>,
        candidates: Mutex<Vec<IceCandidate>>,
        opened: Mutex<Vec<String>>,
        data: Mutex<Vec<(String, Vec<u8>)>>,
        renegotiations: AtomicUsize,
    }

    impl SessionObserver for RecordingObserver {
        fn on_local_candidate(&self, candidate: IceCandidate) {
            self.candidates.lock().push(candidate);
        }

        fn on_connection_state(&self, state: ConnectionState) {
            self.states.lock().push(state);
        }

        fn on_channel_open(&self, label: &str) {
            self.opened.lock().push(label.to_string());
        }

        fn on_data(&self, label: &str, payload: Bytes) {
            self.data.lock().push((label.to_string(), payload.to_vec()));
        }

        fn on_renegotiation_needed(&self) {
            self.renegotiations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn host_candidate(n: u16) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 UDP 2122252543 192.0.2.1 {} typ host", n, 50000 + n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    #[tokio::test]
    async fn initiator_opens_exactly_one_default_channel() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine.clone())
            .await
            .unwrap();

        assert_eq!(session.local_channel_count(), 1);
        assert_eq!(session.remote_channel_count(), 0);
        assert!(engine.connection(0).channels.lock().contains_key("ion-sfu"));
    }

    #[tokio::test]
    async fn responder_opens_no_channel_at_creation() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Responder, SessionConfig::default(), engine)
            .await
            .unwrap();

        assert_eq!(session.local_channel_count(), 0);
        assert_eq!(session.remote_channel_count(), 0);
    }

    #[tokio::test]
    async fn default_channel_failure_is_not_fatal() {
        let engine = MockEngine::failing_channel_creation();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine)
            .await
            .unwrap();

        assert_eq!(session.local_channel_count(), 0);
    }

    #[tokio::test]
    async fn explicit_channel_creation_failure_is_reported() {
        let engine = MockEngine::failing_channel_creation();
        let session = PeerSession::create(Role::Responder, SessionConfig::default(), engine)
            .await
            .unwrap();

        let result = session.create_data_channel("extra").await;
        assert!(matches!(result, Err(SessionError::ChannelCreation(_))));
        assert_eq!(session.local_channel_count(), 0);
    }

    #[tokio::test]
    async fn offer_fails_when_local_application_fails() {
        let engine = MockEngine::failing_local_description();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine)
            .await
            .unwrap();

        let result = session.offer().await;
        assert!(matches!(result, Err(SessionError::Engine(_))));
        // The failed attempt must not have committed a transition
        assert_eq!(session.signaling_state().await, SignalingState::Stable);
    }

    #[tokio::test]
    async fn out_of_order_negotiation_fails_fast() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Responder, SessionConfig::default(), engine.clone())
            .await
            .unwrap();
        let connection = engine.connection(0);

        // No remote offer yet: answering is illegal and must not reach the engine
        assert!(matches!(
            session.answer().await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(connection.create_answer_calls.load(Ordering::SeqCst), 0);

        // A remote answer with no local offer outstanding is just as illegal
        let stray_answer = SessionDescription::answer("v=0\r\nstray");
        assert!(matches!(
            session.set_remote_description(stray_answer).await,
            Err(SessionError::InvalidState(_))
        ));
        assert_eq!(connection.set_remote_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn candidates_queue_until_remote_description() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine.clone())
            .await
            .unwrap();
        let connection = engine.connection(0);

        session.add_remote_candidate(host_candidate(1));
        session.add_remote_candidate(host_candidate(2));
        assert_eq!(connection.queued_candidates.lock().len(), 2);
        assert_eq!(connection.applied_candidates.lock().len(), 0);

        session.offer().await.unwrap();
        session
            .set_remote_description(SessionDescription::answer("v=0\r\nanswer"))
            .await
            .unwrap();
        session.add_remote_candidate(host_candidate(3));

        assert_eq!(connection.queued_candidates.lock().len(), 0);
        assert_eq!(connection.applied_candidates.lock().len(), 3);
    }

    #[tokio::test]
    async fn send_to_unknown_label_is_a_silent_no_op() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine.clone())
            .await
            .unwrap();

        // Locally created but never reported open by the engine: no delivery
        session.send_data("ion-sfu", b"too early");
        session.send_data("nonexistent", b"nothing");

        let connection = engine.connection(0);
        assert_eq!(connection.local_channel("ion-sfu").sent_count(), 0);
    }

    #[tokio::test]
    async fn close_closes_every_channel_and_blocks_further_use() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine.clone())
            .await
            .unwrap();
        let connection = engine.connection(0);

        let remote = connection.open_remote_channel("ion-sfu");
        settle().await;
        assert_eq!(session.remote_channel_count(), 1);

        session.close().await.unwrap();

        assert!(connection.local_channel("ion-sfu").is_closed());
        assert!(remote.is_closed());
        assert!(connection.closed.load(Ordering::SeqCst));

        // No delivery after close
        session.send_data("ion-sfu", b"late");
        assert_eq!(remote.sent_count(), 0);

        // Every operation now fails, the second close included
        assert!(matches!(session.close().await, Err(SessionError::InvalidState(_))));
        assert!(matches!(session.offer().await, Err(SessionError::InvalidState(_))));
        assert!(matches!(session.mute_audio(), Err(SessionError::InvalidState(_))));
    }

    #[tokio::test]
    async fn mute_toggles_audio_senders_only() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Initiator, SessionConfig::default(), engine.clone())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        session.register_observer(&observer);

        session.add_audio_track().await.unwrap();
        settle().await;
        // Adding a track after creation requires a fresh negotiation cycle
        assert_eq!(observer.renegotiations.load(Ordering::SeqCst), 1);

        let connection = engine.connection(0);
        session.mute_audio().unwrap();
        assert!(!connection.senders.lock()[0].is_enabled());

        session.unmute_audio().unwrap();
        assert!(connection.senders.lock()[0].is_enabled());
    }

    #[tokio::test]
    async fn engine_events_reach_the_observer() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Responder, SessionConfig::default(), engine.clone())
            .await
            .unwrap();
        let observer = Arc::new(RecordingObserver::default());
        session.register_observer(&observer);
        let connection = engine.connection(0);

        connection.fire_candidate(host_candidate(7));
        connection.fire_state(ConnectionState::Connecting);
        connection.fire_data("ion-sfu", b"ping");
        settle().await;

        assert_eq!(observer.candidates.lock().len(), 1);
        assert_eq!(*observer.states.lock(), vec![ConnectionState::Connecting]);
        assert_eq!(
            *observer.data.lock(),
            vec![("ion-sfu".to_string(), b"ping".to_vec())]
        );
    }

    #[tokio::test]
    async fn dropped_observer_is_skipped_silently() {
        let engine = MockEngine::new();
        let session = PeerSession::create(Role::Responder, SessionConfig::default(), engine.clone())
            .await
            .unwrap();
        let connection = engine.connection(0);

        let observer = Arc::new(RecordingObserver::default());
        session.register_observer(&observer);
        drop(observer);

        connection.fire_state(ConnectionState::Connected);
        connection.open_remote_channel("ion-sfu");
        settle().await;

        // Registry updates still happen without a live observer
        assert_eq!(session.remote_channel_count(), 1);
    }

    #[tokio::test]
    async fn offer_answer_handshake_end_to_end() {
        init_logging();
        let engine = MockEngine::new();

        let initiator =
            PeerSession::create(Role::Initiator, SessionConfig::default(), engine.clone())
                .await
                .unwrap();
        let responder =
            PeerSession::create(Role::Responder, SessionConfig::default(), engine.clone())
                .await
                .unwrap();
        assert_eq!(initiator.local_channel_count(), 1);
        assert_eq!(responder.local_channel_count(), 0);

        let initiator_observer = Arc::new(RecordingObserver::default());
        let responder_observer = Arc::new(RecordingObserver::default());
        initiator.register_observer(&initiator_observer);
        responder.register_observer(&responder_observer);

        // Offer/answer exchange over the (external) signaling path
        let offer = initiator.offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);

        responder.set_remote_description(offer).await.unwrap();
        let answer = responder.answer().await.unwrap();
        assert_eq!(answer.kind, SdpKind::Answer);

        initiator.set_remote_description(answer).await.unwrap();
        assert_eq!(initiator.signaling_state().await, SignalingState::Stable);
        assert_eq!(responder.signaling_state().await, SignalingState::Stable);

        // The simulated engine reports both transports up and completes the
        // default channel's open handshake on each side
        let initiator_connection = engine.connection(0);
        let responder_connection = engine.connection(1);
        initiator_connection.fire_state(ConnectionState::Connected);
        responder_connection.fire_state(ConnectionState::Connected);
        let initiator_channel = initiator_connection.open_remote_channel("ion-sfu");
        responder_connection.open_remote_channel("ion-sfu");
        settle().await;

        assert!(initiator_observer
            .states
            .lock()
            .contains(&ConnectionState::Connected));
        assert!(responder_observer
            .states
            .lock()
            .contains(&ConnectionState::Connected));
        assert_eq!(*initiator_observer.opened.lock(), vec!["ion-sfu".to_string()]);

        initiator.send_data("ion-sfu", b"hello");
        assert_eq!(initiator_channel.sent_count(), 1);
    }
}
