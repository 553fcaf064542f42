//! In-process engine
//!
//! Peers created by the same [`MemoryEngine`] find each other through a
//! marker line (`a=x-memory-peer:<token>`) carried in their SDP. Once both
//! sides hold a local and a remote description the pair "connects":
//! connection state goes `connecting` -> `connected`, data channels are
//! linked end to end and every attached sender is announced to the other
//! side as a remote track.
//!
//! No media flows. Frames sent on a data channel are handed straight to the
//! twin channel's message slot.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};

use super::{
    ChannelEventSlots, DataChannelBackend, DataChannelInit, DataChannelState, DataFrame,
    LocalTrackBackend, PeerConfig, PeerConnectionBackend, PeerEventSlots, RemoteTrack,
    RtcEngine, RtpSenderBackend,
};
use crate::error::{AppError, Result};
use crate::media::{FacingMode, MediaDeviceInfo, MediaKind};
use crate::webrtc::signaling::{
    ConnectionState, IceCandidate, OfferOptions, SdpDescription, SdpType,
};

const PEER_MARKER: &str = "a=x-memory-peer:";

/// Shared peer directory
#[derive(Default)]
struct Network {
    peers: Mutex<Vec<Arc<MemoryPeer>>>,
}

impl Network {
    fn find(&self, token: &str) -> Option<Arc<MemoryPeer>> {
        self.peers.lock().iter().find(|p| p.token == token).cloned()
    }
}

/// Deterministic engine for tests and the loopback CLI
pub struct MemoryEngine {
    devices: RwLock<Vec<MediaDeviceInfo>>,
    network: Arc<Network>,
    tracks: Mutex<Vec<Arc<MemoryLocalTrack>>>,
}

impl MemoryEngine {
    /// Engine with a front camera, a back camera and one microphone
    pub fn new() -> Self {
        Self::with_devices(vec![
            MediaDeviceInfo::camera("front-0", Some(FacingMode::User)),
            MediaDeviceInfo::camera("back-1", Some(FacingMode::Environment)),
            MediaDeviceInfo::microphone("mic-0", "Built-in Microphone"),
        ])
    }

    pub fn with_devices(devices: Vec<MediaDeviceInfo>) -> Self {
        Self {
            devices: RwLock::new(devices),
            network: Arc::new(Network::default()),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_devices(&self, devices: Vec<MediaDeviceInfo>) {
        *self.devices.write() = devices;
    }

    /// Peer connections in creation order (closed ones included)
    pub fn peers(&self) -> Vec<Arc<MemoryPeer>> {
        self.network.peers.lock().clone()
    }

    pub fn peer(&self, index: usize) -> Option<Arc<MemoryPeer>> {
        self.network.peers.lock().get(index).cloned()
    }

    /// Capture tracks that have not been stopped
    pub fn live_track_count(&self) -> usize {
        self.tracks.lock().iter().filter(|t| !t.is_stopped()).count()
    }

    /// Device a capture track was opened on
    pub fn track_device(&self, track_id: &str) -> Option<String> {
        self.tracks
            .lock()
            .iter()
            .find(|t| t.id() == track_id)
            .map(|t| t.device_id().to_string())
    }

    fn devices_of(&self, kind: MediaKind) -> Vec<MediaDeviceInfo> {
        self.devices
            .read()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    fn register_track(&self, track: MemoryLocalTrack) -> Arc<dyn LocalTrackBackend> {
        let track = Arc::new(track);
        self.tracks.lock().push(track.clone());
        track
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RtcEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_peer_connection(
        &self,
        config: &PeerConfig,
        events: Arc<PeerEventSlots>,
    ) -> Result<Arc<dyn PeerConnectionBackend>> {
        let network = Arc::downgrade(&self.network);
        let peer = Arc::new_cyclic(|me| MemoryPeer {
            token: uuid::Uuid::new_v4().simple().to_string(),
            me: me.clone(),
            network,
            events,
            inner: Mutex::new(PeerInner::default()),
            applied_candidates: AtomicUsize::new(0),
            gathered: AtomicBool::new(false),
            refuse_senders: Arc::new(AtomicBool::new(false)),
        });
        debug!(
            "Memory peer {} created with {} ICE server(s)",
            peer.token,
            config.ice_servers.len()
        );
        self.network.peers.lock().push(peer.clone());
        Ok(peer)
    }

    async fn audio_input_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(self.devices_of(MediaKind::Audio))
    }

    async fn video_input_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(self.devices_of(MediaKind::Video))
    }

    async fn create_audio_track(
        &self,
        track_id: &str,
        device_id: Option<&str>,
    ) -> Result<Arc<dyn LocalTrackBackend>> {
        let microphones = self.devices_of(MediaKind::Audio);
        let device = match device_id {
            Some(id) => microphones.iter().find(|d| d.device_id == id),
            None => microphones.first(),
        }
        .ok_or_else(|| {
            AppError::DeviceUnavailable(format!(
                "no microphone{}",
                device_id.map(|id| format!(" with id {}", id)).unwrap_or_default()
            ))
        })?;

        Ok(self.register_track(MemoryLocalTrack::new(
            track_id,
            MediaKind::Audio,
            &device.device_id,
        )))
    }

    async fn create_video_track(
        &self,
        track_id: &str,
        device: &MediaDeviceInfo,
    ) -> Result<Arc<dyn LocalTrackBackend>> {
        if !self
            .devices_of(MediaKind::Video)
            .iter()
            .any(|d| d.device_id == device.device_id)
        {
            return Err(AppError::DeviceUnavailable(format!(
                "camera {} is gone",
                device.device_id
            )));
        }
        Ok(self.register_track(MemoryLocalTrack::new(
            track_id,
            MediaKind::Video,
            &device.device_id,
        )))
    }
}

#[derive(Default)]
struct PeerInner {
    local: Option<SdpDescription>,
    remote: Option<SdpDescription>,
    state: ConnectionStateCell,
    linked: bool,
    closed: bool,
    channels: Vec<Arc<MemoryChannel>>,
    senders: Vec<Arc<MemorySender>>,
    next_stream_id: u16,
    sdp_version: u32,
}

struct ConnectionStateCell(ConnectionState);

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self(ConnectionState::New)
    }
}

/// One in-process peer connection
pub struct MemoryPeer {
    token: String,
    me: Weak<MemoryPeer>,
    network: Weak<Network>,
    events: Arc<PeerEventSlots>,
    inner: Mutex<PeerInner>,
    applied_candidates: AtomicUsize,
    gathered: AtomicBool,
    refuse_senders: Arc<AtomicBool>,
}

impl MemoryPeer {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Remote candidates the engine actually applied
    pub fn applied_candidate_count(&self) -> usize {
        self.applied_candidates.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Make `add_track` and `replace_track` fail (e.g. to simulate an encoder error)
    pub fn refuse_sender_changes(&self, refuse: bool) {
        self.refuse_senders.store(refuse, Ordering::SeqCst);
    }

    /// Announce a remote track as if it arrived from the network
    pub fn emit_remote_track(&self, id: &str, kind: MediaKind) {
        self.events
            .remote_track(RemoteTrack::new(id, kind, Arc::new(id.to_string())));
    }

    /// Force a connection state change (e.g. to simulate ICE failure)
    pub fn set_connection_state(&self, state: ConnectionState) {
        self.transition(state);
    }

    /// Bring up an inbound channel as if the remote peer had opened it
    pub fn emit_inbound_channel(&self, label: &str) -> Arc<dyn DataChannelBackend> {
        let channel = self.register_channel(label, &DataChannelInit::default(), false);
        self.events.data_channel(channel.clone());
        channel.transition(DataChannelState::Open);
        channel
    }

    fn transition(&self, state: ConnectionState) {
        {
            let mut inner = self.inner.lock();
            if inner.state.0 == state {
                return;
            }
            inner.state.0 = state;
        }
        debug!("Memory peer {} -> {}", self.token, state);
        self.events.connection_state(state);
    }

    fn register_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
        link_on_attach: bool,
    ) -> Arc<MemoryChannel> {
        let channel = Arc::new_cyclic(|me| MemoryChannel {
            me: me.clone(),
            owner: self.me.clone(),
            label: label.to_string(),
            init: init.clone(),
            stream_id: Mutex::new(init.negotiated_id),
            state: Mutex::new(DataChannelState::Connecting),
            slots: RwLock::new(None),
            twin: Mutex::new(Weak::new()),
            link_on_attach: AtomicBool::new(link_on_attach),
        });
        self.inner.lock().channels.push(channel.clone());
        channel
    }

    fn next_stream_id(&self) -> u16 {
        let mut inner = self.inner.lock();
        let id = inner.next_stream_id;
        inner.next_stream_id = inner.next_stream_id.wrapping_add(1);
        id
    }

    fn remote_peer(&self) -> Option<Arc<MemoryPeer>> {
        let token = {
            let inner = self.inner.lock();
            inner.remote.as_ref().and_then(|d| peer_token(&d.sdp))?
        };
        self.network.upgrade()?.find(&token)
    }

    fn is_linked(&self) -> bool {
        self.inner.lock().linked
    }

    fn ready_to_link(&self) -> bool {
        let inner = self.inner.lock();
        !inner.closed && !inner.linked && inner.local.is_some() && inner.remote.is_some()
    }

    /// Connect with the remote peer once both sides hold both descriptions
    fn try_link(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let Some(remote) = self.remote_peer() else {
            return;
        };
        if !me.ready_to_link() || !remote.ready_to_link() {
            return;
        }
        if remote.remote_peer().map(|p| p.token != me.token).unwrap_or(true) {
            return;
        }
        me.inner.lock().linked = true;
        remote.inner.lock().linked = true;
        info!("Memory peers {} <-> {} linked", me.token, remote.token);

        for peer in [&me, &remote] {
            peer.transition(ConnectionState::Connecting);
        }
        for peer in [&me, &remote] {
            peer.transition(ConnectionState::Connected);
        }

        for (from, to) in [(&me, &remote), (&remote, &me)] {
            let pending: Vec<Arc<MemoryChannel>> = from
                .inner
                .lock()
                .channels
                .iter()
                .filter(|c| c.init.negotiated_id.is_none() && c.is_unlinked())
                .cloned()
                .collect();
            for channel in pending {
                channel.link_on_attach.store(false, Ordering::SeqCst);
                link_outbound(&channel, to);
            }
        }

        let negotiated: Vec<Arc<MemoryChannel>> = me
            .inner
            .lock()
            .channels
            .iter()
            .filter(|c| c.init.negotiated_id.is_some() && c.is_unlinked())
            .cloned()
            .collect();
        for channel in negotiated {
            channel.link_on_attach.store(false, Ordering::SeqCst);
            link_negotiated(&channel, &remote);
        }

        announce_tracks(&me, &remote);
        announce_tracks(&remote, &me);
    }
}

fn peer_token(sdp: &str) -> Option<String> {
    sdp.lines()
        .find_map(|line| line.trim().strip_prefix(PEER_MARKER))
        .map(|token| token.trim().to_string())
}

/// Create the far end of a locally opened channel and open both
fn link_outbound(channel: &Arc<MemoryChannel>, remote: &Arc<MemoryPeer>) {
    let Some(owner) = channel.owner.upgrade() else {
        return;
    };
    let stream_id = owner.next_stream_id();
    *channel.stream_id.lock() = Some(stream_id);

    let mut init = channel.init.clone();
    init.negotiated_id = None;
    let far = remote.register_channel(&channel.label, &init, false);
    *far.stream_id.lock() = Some(stream_id);
    *far.twin.lock() = Arc::downgrade(channel);
    *channel.twin.lock() = Arc::downgrade(&far);

    remote.events.data_channel(far.clone());
    channel.transition(DataChannelState::Open);
    far.transition(DataChannelState::Open);
}

/// Pair a negotiated channel with the remote channel sharing its id
fn link_negotiated(channel: &Arc<MemoryChannel>, remote: &Arc<MemoryPeer>) {
    let id = channel.init.negotiated_id;
    let far = remote
        .inner
        .lock()
        .channels
        .iter()
        .find(|c| c.init.negotiated_id == id && c.is_unlinked())
        .cloned();
    let Some(far) = far else {
        trace!("Negotiated channel {:?} waiting for remote twin", id);
        return;
    };
    far.link_on_attach.store(false, Ordering::SeqCst);
    *far.twin.lock() = Arc::downgrade(channel);
    *channel.twin.lock() = Arc::downgrade(&far);
    channel.transition(DataChannelState::Open);
    far.transition(DataChannelState::Open);
}

fn announce_tracks(from: &Arc<MemoryPeer>, to: &Arc<MemoryPeer>) {
    let senders = from.inner.lock().senders.clone();
    for sender in senders {
        let Some(track) = sender.track.lock().clone() else {
            continue;
        };
        let id = track.id().to_string();
        to.events
            .remote_track(RemoteTrack::new(id.clone(), track.kind(), Arc::new(id)));
    }
}

fn build_sdp(token: &str, version: u32, options: &OfferOptions, senders: &[MediaKind]) -> String {
    let mut sdp = format!(
        "v=0\r\no=- {} {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n{}{}\r\n",
        u64::from_str_radix(&token[..12], 16).unwrap_or_default(),
        version,
        PEER_MARKER,
        token
    );
    let mut mid = 0;
    for (kind, receive) in [
        (MediaKind::Audio, options.offer_to_receive_audio),
        (MediaKind::Video, options.offer_to_receive_video),
    ] {
        let send = senders.contains(&kind);
        if !send && !receive {
            continue;
        }
        let direction = match (send, receive) {
            (true, true) => "sendrecv",
            (true, false) => "sendonly",
            _ => "recvonly",
        };
        sdp.push_str(&format!(
            "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na={}\r\n",
            kind, mid, direction
        ));
        mid += 1;
    }
    sdp.push_str(&format!(
        "m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:{}\r\n",
        mid
    ));
    sdp
}

#[async_trait]
impl PeerConnectionBackend for MemoryPeer {
    async fn set_local_description(&self, desc: SdpDescription) -> Result<()> {
        validate_sdp(&desc)?;
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(AppError::NegotiationRejected(
                    "peer connection is closed".to_string(),
                ));
            }
            if desc.sdp_type == SdpType::Answer
                && inner.remote.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer)
            {
                return Err(AppError::NegotiationRejected(
                    "cannot set local answer without a remote offer".to_string(),
                ));
            }
            inner.local = Some(desc);
        }

        if !self.gathered.swap(true, Ordering::SeqCst) {
            self.events.ice_candidate(IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host".to_string(),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            });
        }

        self.try_link();
        Ok(())
    }

    async fn set_remote_description(&self, desc: SdpDescription) -> Result<()> {
        validate_sdp(&desc)?;
        if peer_token(&desc.sdp).as_deref() == Some(self.token.as_str()) {
            return Err(AppError::NegotiationRejected(
                "remote description is our own".to_string(),
            ));
        }
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(AppError::NegotiationRejected(
                    "peer connection is closed".to_string(),
                ));
            }
            let local_type = inner.local.as_ref().map(|d| d.sdp_type);
            match desc.sdp_type {
                SdpType::Answer if local_type != Some(SdpType::Offer) => {
                    return Err(AppError::NegotiationRejected(
                        "no pending local offer for remote answer".to_string(),
                    ));
                }
                SdpType::Offer if local_type == Some(SdpType::Offer) && !inner.linked => {
                    return Err(AppError::NegotiationRejected(
                        "remote offer collides with pending local offer".to_string(),
                    ));
                }
                _ => {}
            }
            inner.remote = Some(desc);
        }
        self.try_link();
        Ok(())
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SdpDescription> {
        let (version, kinds) = self.sdp_inputs();
        Ok(SdpDescription::offer(build_sdp(
            &self.token,
            version,
            options,
            &kinds,
        )))
    }

    async fn create_answer(&self, options: &OfferOptions) -> Result<SdpDescription> {
        if self.inner.lock().remote.as_ref().map(|d| d.sdp_type) != Some(SdpType::Offer) {
            return Err(AppError::NegotiationRejected(
                "createAnswer requires a remote offer".to_string(),
            ));
        }
        let (version, kinds) = self.sdp_inputs();
        Ok(SdpDescription::answer(build_sdp(
            &self.token,
            version,
            options,
            &kinds,
        )))
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().remote.is_some()
    }

    fn connection_state(&self) -> ConnectionState {
        self.inner.lock().state.0
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.inner.lock().remote.is_none() {
            return Err(AppError::Engine("remote description not set".to_string()));
        }
        if !candidate.candidate.starts_with("candidate:") {
            return Err(AppError::Engine(format!(
                "malformed candidate: {}",
                candidate.candidate
            )));
        }
        self.applied_candidates.fetch_add(1, Ordering::SeqCst);
        trace!("Memory peer {} applied {}", self.token, candidate.candidate);
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn DataChannelBackend>> {
        if self.inner.lock().closed {
            return Err(AppError::Engine("peer connection is closed".to_string()));
        }
        // Channels opened after connecting link up once their handlers exist
        let channel = self.register_channel(label, init, self.is_linked());
        Ok(channel)
    }

    async fn add_track(
        &self,
        track: Arc<dyn LocalTrackBackend>,
    ) -> Result<Arc<dyn RtpSenderBackend>> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(AppError::Engine("peer connection is closed".to_string()));
        }
        if self.refuse_senders.load(Ordering::SeqCst) {
            return Err(AppError::Engine(format!("sender for {} refused", track.id())));
        }
        for sender in &inner.senders {
            if sender.track.lock().as_ref().map(|t| t.id()) == Some(track.id()) {
                return Err(AppError::Engine(format!(
                    "track {} already has a sender",
                    track.id()
                )));
            }
        }
        let sender = Arc::new(MemorySender {
            kind: track.kind(),
            track: Mutex::new(Some(track)),
            refuse: self.refuse_senders.clone(),
        });
        inner.senders.push(sender.clone());
        Ok(sender)
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSenderBackend>> {
        self.inner
            .lock()
            .senders
            .iter()
            .map(|s| s.clone() as Arc<dyn RtpSenderBackend>)
            .collect()
    }

    async fn remove_track(&self, sender: Arc<dyn RtpSenderBackend>) -> Result<()> {
        let sender = sender
            .as_any()
            .downcast_ref::<MemorySender>()
            .ok_or_else(|| AppError::Engine("sender belongs to another engine".to_string()))?;
        // The sender stays, detached, like a stopped transceiver
        sender.track.lock().take();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let channels = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            std::mem::take(&mut inner.channels)
        };
        for channel in channels {
            channel.shutdown();
        }
        let remote = self.remote_peer();
        self.transition(ConnectionState::Closed);
        if let Some(remote) = remote {
            if remote.is_linked() && !remote.is_closed() {
                remote.transition(ConnectionState::Disconnected);
            }
        }
        info!("Memory peer {} closed", self.token);
        Ok(())
    }
}

impl MemoryPeer {
    fn sdp_inputs(&self) -> (u32, Vec<MediaKind>) {
        let mut inner = self.inner.lock();
        inner.sdp_version += 1;
        let kinds = inner
            .senders
            .iter()
            .filter(|s| s.track.lock().is_some())
            .map(|s| s.kind)
            .collect();
        (inner.sdp_version, kinds)
    }
}

fn validate_sdp(desc: &SdpDescription) -> Result<()> {
    if !desc.sdp.trim_start().starts_with("v=0") {
        return Err(AppError::NegotiationRejected(format!(
            "invalid {} SDP: missing v=0 line",
            desc.sdp_type
        )));
    }
    Ok(())
}

/// In-process data channel
pub struct MemoryChannel {
    me: Weak<MemoryChannel>,
    owner: Weak<MemoryPeer>,
    label: String,
    init: DataChannelInit,
    stream_id: Mutex<Option<u16>>,
    state: Mutex<DataChannelState>,
    slots: RwLock<Option<Arc<ChannelEventSlots>>>,
    twin: Mutex<Weak<MemoryChannel>>,
    link_on_attach: AtomicBool,
}

impl MemoryChannel {
    fn is_unlinked(&self) -> bool {
        self.twin.lock().upgrade().is_none() && *self.state.lock() == DataChannelState::Connecting
    }

    /// Move forward to `state`, notifying the handler slots
    fn transition(&self, state: DataChannelState) {
        {
            let mut current = self.state.lock();
            if state_rank(state) <= state_rank(*current) {
                return;
            }
            *current = state;
        }
        trace!("Memory channel {} -> {}", self.label, state);
        let slots = self.slots.read().clone();
        if let Some(slots) = slots {
            slots.state_change(state);
        }
    }

    fn shutdown(&self) {
        let twin = self.twin.lock().upgrade();
        self.transition(DataChannelState::Closing);
        if let Some(twin) = &twin {
            twin.transition(DataChannelState::Closing);
        }
        self.transition(DataChannelState::Closed);
        if let Some(twin) = &twin {
            twin.transition(DataChannelState::Closed);
        }
    }
}

fn state_rank(state: DataChannelState) -> u8 {
    match state {
        DataChannelState::Connecting => 0,
        DataChannelState::Open => 1,
        DataChannelState::Closing => 2,
        DataChannelState::Closed => 3,
    }
}

#[async_trait]
impl DataChannelBackend for MemoryChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> Option<u16> {
        *self.stream_id.lock()
    }

    fn ready_state(&self) -> DataChannelState {
        *self.state.lock()
    }

    async fn send(&self, frame: DataFrame) -> Result<()> {
        let state = *self.state.lock();
        if state != DataChannelState::Open {
            return Err(AppError::Engine(format!(
                "data channel {} is {}",
                self.label, state
            )));
        }
        let twin = self
            .twin
            .lock()
            .upgrade()
            .ok_or_else(|| AppError::Engine(format!("data channel {} has no peer", self.label)))?;
        let slots = twin.slots.read().clone();
        if let Some(slots) = slots {
            slots.message(frame);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    fn attach_events(&self, events: Arc<ChannelEventSlots>) {
        *self.slots.write() = Some(events);

        if !self.link_on_attach.swap(false, Ordering::SeqCst) {
            return;
        }
        let (Some(me), Some(owner)) = (self.me.upgrade(), self.owner.upgrade()) else {
            return;
        };
        let link = move || {
            let Some(remote) = owner.remote_peer() else {
                return;
            };
            if !me.is_unlinked() {
                return;
            }
            if me.init.negotiated_id.is_some() {
                link_negotiated(&me, &remote);
            } else {
                link_outbound(&me, &remote);
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { link() });
            }
            Err(_) => link(),
        }
    }
}

/// Outbound sender
pub struct MemorySender {
    kind: MediaKind,
    track: Mutex<Option<Arc<dyn LocalTrackBackend>>>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl RtpSenderBackend for MemorySender {
    async fn track_id(&self) -> Option<String> {
        self.track.lock().as_ref().map(|t| t.id().to_string())
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: Arc<dyn LocalTrackBackend>) -> Result<()> {
        if track.kind() != self.kind {
            return Err(AppError::Engine(format!(
                "cannot replace {} track with {}",
                self.kind,
                track.kind()
            )));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(AppError::Engine(format!("replace with {} refused", track.id())));
        }
        *self.track.lock() = Some(track);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Capture track with no media behind it
pub struct MemoryLocalTrack {
    id: String,
    kind: MediaKind,
    device_id: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MemoryLocalTrack {
    fn new(id: &str, kind: MediaKind, device_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            device_id: device_id.to_string(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl LocalTrackBackend for MemoryLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ChannelEventHandlers, PeerEventHandlers};

    async fn connected_pair(
        engine: &MemoryEngine,
    ) -> (Arc<dyn PeerConnectionBackend>, Arc<dyn PeerConnectionBackend>) {
        let a = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let b = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let options = OfferOptions::default();
        let offer = a.create_offer(&options).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer(&options).await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_offer_answer_connects() {
        let engine = MemoryEngine::new();
        let (a, b) = connected_pair(&engine).await;
        assert_eq!(a.connection_state(), ConnectionState::Connected);
        assert_eq!(b.connection_state(), ConnectionState::Connected);

        a.close().await.unwrap();
        assert_eq!(a.connection_state(), ConnectionState::Closed);
        assert_eq!(b.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejects_garbage_sdp() {
        let engine = MemoryEngine::new();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let result = peer
            .set_remote_description(SdpDescription::offer("not sdp"))
            .await;
        assert!(matches!(result, Err(AppError::NegotiationRejected(_))));
        assert!(peer.create_answer(&OfferOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_frames_reach_twin() {
        let engine = MemoryEngine::new();
        let inbound: Arc<Mutex<Vec<Arc<dyn DataChannelBackend>>>> = Arc::default();
        let sink = inbound.clone();
        let b_events = PeerEventSlots::new(PeerEventHandlers {
            on_data_channel: Some(Box::new(move |channel: Arc<dyn DataChannelBackend>| sink.lock().push(channel))),
            ..Default::default()
        });

        let a = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let b = engine
            .create_peer_connection(&PeerConfig::default(), b_events)
            .await
            .unwrap();
        let chat = a
            .create_data_channel("chat", &DataChannelInit::default())
            .await
            .unwrap();

        let options = OfferOptions::default();
        let offer = a.create_offer(&options).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer(&options).await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        assert_eq!(chat.ready_state(), DataChannelState::Open);
        let far = inbound.lock().first().cloned().unwrap();
        assert_eq!(far.label(), "chat");
        assert_eq!(far.id(), chat.id());

        let received: Arc<Mutex<Vec<DataFrame>>> = Arc::default();
        let frames = received.clone();
        far.attach_events(ChannelEventSlots::new(ChannelEventHandlers {
            on_message: Some(Box::new(move |frame: DataFrame| frames.lock().push(frame))),
            ..Default::default()
        }));

        chat.send(DataFrame::binary(vec![1u8, 2, 3])).await.unwrap();
        assert_eq!(received.lock()[0], DataFrame::binary(vec![1u8, 2, 3]));

        chat.close().await.unwrap();
        assert_eq!(far.ready_state(), DataChannelState::Closed);
        assert!(chat.send(DataFrame::text("late")).await.is_err());
    }

    #[tokio::test]
    async fn test_candidates_need_remote_description() {
        let engine = MemoryEngine::new();
        let (a, _b) = connected_pair(&engine).await;
        let fresh = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let candidate = IceCandidate::new("candidate:1 1 udp 1 10.0.0.1 5000 typ host");

        assert!(fresh.add_ice_candidate(candidate.clone()).await.is_err());
        a.add_ice_candidate(candidate).await.unwrap();
        assert_eq!(engine.peer(0).unwrap().applied_candidate_count(), 1);
        assert_eq!(engine.peer(2).unwrap().applied_candidate_count(), 0);
    }

    #[tokio::test]
    async fn test_removed_sender_is_detached() {
        let engine = MemoryEngine::new();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let track = engine.create_audio_track("audio_track_1", None).await.unwrap();
        let sender = peer.add_track(track.clone()).await.unwrap();
        assert_eq!(sender.track_id().await.as_deref(), Some("audio_track_1"));
        assert!(peer.add_track(track).await.is_err());

        peer.remove_track(sender.clone()).await.unwrap();
        assert_eq!(sender.track_id().await, None);
        assert_eq!(peer.senders().await.len(), 1);
    }

    #[test]
    fn test_refused_sender_changes_leave_binding() {
        let engine = MemoryEngine::new();
        tokio_test::block_on(async {
            let peer = engine
                .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
                .await
                .unwrap();
            let first = engine.create_audio_track("audio_track_1", None).await.unwrap();
            let second = engine.create_audio_track("audio_track_2", None).await.unwrap();
            let sender = peer.add_track(first).await.unwrap();

            engine.peer(0).unwrap().refuse_sender_changes(true);
            assert!(sender.replace_track(second.clone()).await.is_err());
            assert!(peer.add_track(second.clone()).await.is_err());
            assert_eq!(sender.track_id().await.as_deref(), Some("audio_track_1"));
            assert_eq!(peer.senders().await.len(), 1);

            engine.peer(0).unwrap().refuse_sender_changes(false);
            sender.replace_track(second).await.unwrap();
            assert_eq!(sender.track_id().await.as_deref(), Some("audio_track_2"));
        });
    }

    #[test]
    fn test_default_devices_listed() {
        let engine = MemoryEngine::new();
        let cameras = tokio_test::block_on(engine.video_input_devices()).unwrap();
        let mics = tokio_test::block_on(engine.audio_input_devices()).unwrap();
        assert!(!cameras.is_empty());
        assert!(!mics.is_empty());
    }
}
