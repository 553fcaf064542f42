//! Engine backed by the `webrtc` crate
//!
//! Each peer connection is built with the default codec set and
//! interceptors. Native callbacks are forwarded into the session's
//! [`PeerEventSlots`]; nothing here holds a reference back to the session.
//!
//! Capture is external: local tracks are `TrackLocalStaticSample`s fed
//! through [`RtcLocalTrack::write_sample`], and the device list is whatever
//! the embedder configures.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info, trace};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::{
    ChannelEventSlots, DataChannelBackend, DataChannelInit, DataChannelState, DataFrame,
    LocalTrackBackend, PeerConfig, PeerConnectionBackend, PeerEventSlots, RemoteTrack,
    RtcEngine, RtpSenderBackend,
};
use crate::config::IceServer;
use crate::error::{AppError, Result};
use crate::media::{MediaDeviceInfo, MediaKind};
use crate::webrtc::signaling::{
    ConnectionState, IceCandidate, OfferOptions, SdpDescription, SdpType,
};

/// Stream id shared by every local track of one engine
const LOCAL_STREAM_ID: &str = "cap-webrtc";

/// webrtc-rs engine
pub struct WebRtcEngine {
    devices: RwLock<Vec<MediaDeviceInfo>>,
}

impl WebRtcEngine {
    /// Engine without capture devices (data channels and receive-only media)
    pub fn new() -> Self {
        Self::with_devices(Vec::new())
    }

    pub fn with_devices(devices: Vec<MediaDeviceInfo>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    fn devices_of(&self, kind: MediaKind) -> Vec<MediaDeviceInfo> {
        self.devices
            .read()
            .iter()
            .filter(|d| d.kind == kind)
            .cloned()
            .collect()
    }

    fn build_api() -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::Engine(format!("Failed to register codecs: {}", e)))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::Engine(format!("Failed to register interceptors: {}", e)))?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

impl Default for WebRtcEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.to_vec(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn media_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn channel_state(state: RTCDataChannelState) -> DataChannelState {
    match state {
        RTCDataChannelState::Open => DataChannelState::Open,
        RTCDataChannelState::Closing => DataChannelState::Closing,
        RTCDataChannelState::Closed => DataChannelState::Closed,
        _ => DataChannelState::Connecting,
    }
}

#[async_trait]
impl RtcEngine for WebRtcEngine {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn create_peer_connection(
        &self,
        config: &PeerConfig,
        events: Arc<PeerEventSlots>,
    ) -> Result<Arc<dyn PeerConnectionBackend>> {
        let api = Self::build_api()?;
        let rtc_config = RTCConfiguration {
            ice_servers: rtc_ice_servers(&config.ice_servers),
            ..Default::default()
        };

        let pc = api.new_peer_connection(rtc_config).await.map_err(|e| {
            AppError::Engine(format!("Failed to create peer connection: {}", e))
        })?;
        let peer = Arc::new(RtcPeer {
            pc: Arc::new(pc),
            state: Arc::new(RwLock::new(ConnectionState::New)),
        });
        peer.register_handlers(events);

        info!(
            "Peer connection created ({} ICE server(s))",
            config.ice_servers.len()
        );
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
        if let Some(id) = device_id {
            if !self.devices_of(MediaKind::Audio).iter().any(|d| d.device_id == id) {
                return Err(AppError::DeviceUnavailable(format!("no microphone with id {}", id)));
            }
        }
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        };
        Ok(Arc::new(RtcLocalTrack::new(track_id, MediaKind::Audio, codec)))
    }

    async fn create_video_track(
        &self,
        track_id: &str,
        device: &MediaDeviceInfo,
    ) -> Result<Arc<dyn LocalTrackBackend>> {
        debug!("Opening camera {} for {}", device.device_id, track_id);
        let codec = RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        Ok(Arc::new(RtcLocalTrack::new(track_id, MediaKind::Video, codec)))
    }
}

/// Peer connection wrapper
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    state: Arc<RwLock<ConnectionState>>,
}

impl RtcPeer {
    fn register_handlers(&self, events: Arc<PeerEventSlots>) {
        let state = self.state.clone();
        let slots = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let state = state.clone();
                let slots = slots.clone();
                Box::pin(async move {
                    let Some(new_state) = connection_state(s) else {
                        return;
                    };
                    info!("Peer connection state: {}", new_state);
                    *state.write() = new_state;
                    slots.connection_state(new_state);
                })
            }));

        let slots = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let slots = slots.clone();
                Box::pin(async move {
                    // None marks end of gathering, which is not forwarded
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            debug!("ICE candidate: {}", init.candidate);
                            slots.ice_candidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            });
                        }
                        Err(e) => debug!("Failed to serialize ICE candidate: {}", e),
                    }
                })
            }));

        let slots = events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let slots = slots.clone();
                Box::pin(async move {
                    let Some(kind) = media_kind(track.kind()) else {
                        return;
                    };
                    info!("Remote {} track: {}", kind, track.id());
                    let id = track.id();
                    slots.remote_track(RemoteTrack::new(id, kind, track));
                })
            },
        ));

        let slots = events;
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let slots = slots.clone();
                Box::pin(async move {
                    info!("Inbound data channel: {}", dc.label());
                    slots.data_channel(Arc::new(RtcDataChannel::new(dc)));
                })
            }));
    }

    async fn ensure_receivers(&self, options: &OfferOptions) -> Result<()> {
        let transceivers = self.pc.get_transceivers().await;
        for (kind, wanted) in [
            (RTPCodecType::Audio, options.offer_to_receive_audio),
            (RTPCodecType::Video, options.offer_to_receive_video),
        ] {
            if !wanted || transceivers.iter().any(|t| t.kind() == kind) {
                continue;
            }
            self.pc
                .add_transceiver_from_kind(
                    kind,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| {
                    AppError::Engine(format!("Failed to add {:?} transceiver: {}", kind, e))
                })?;
        }
        Ok(())
    }
}

fn rtc_description(desc: SdpDescription) -> Result<RTCSessionDescription> {
    let parsed = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| AppError::NegotiationRejected(format!("Invalid SDP: {}", e)))
}

fn is_sending(direction: RTCRtpTransceiverDirection) -> bool {
    matches!(
        direction,
        RTCRtpTransceiverDirection::Sendrecv | RTCRtpTransceiverDirection::Sendonly
    )
}

#[async_trait]
impl PeerConnectionBackend for RtcPeer {
    async fn set_local_description(&self, desc: SdpDescription) -> Result<()> {
        let desc = rtc_description(desc)?;
        self.pc.set_local_description(desc).await.map_err(|e| {
            AppError::NegotiationRejected(format!("Failed to set local description: {}", e))
        })
    }

    async fn set_remote_description(&self, desc: SdpDescription) -> Result<()> {
        let desc = rtc_description(desc)?;
        self.pc.set_remote_description(desc).await.map_err(|e| {
            AppError::NegotiationRejected(format!("Failed to set remote description: {}", e))
        })
    }

    async fn create_offer(&self, options: &OfferOptions) -> Result<SdpDescription> {
        self.ensure_receivers(options).await?;
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| AppError::NegotiationRejected(format!("Failed to create offer: {}", e)))?;
        Ok(SdpDescription::offer(offer.sdp))
    }

    async fn create_answer(&self, _options: &OfferOptions) -> Result<SdpDescription> {
        let answer = self.pc.create_answer(None).await.map_err(|e| {
            AppError::NegotiationRejected(format!("Failed to create answer: {}", e))
        })?;
        Ok(SdpDescription::answer(answer.sdp))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn connection_state(&self) -> ConnectionState {
        connection_state(self.pc.connection_state()).unwrap_or(*self.state.read())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Engine(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn DataChannelBackend>> {
        let rtc_init = RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_packet_life_time: init.max_packet_life_time,
            max_retransmits: init.max_retransmits,
            protocol: init.protocol.clone(),
            negotiated: init.negotiated_id,
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(rtc_init))
            .await
            .map_err(|e| AppError::Engine(format!("Failed to create data channel: {}", e)))?;
        Ok(Arc::new(RtcDataChannel::new(dc)))
    }

    async fn add_track(
        &self,
        track: Arc<dyn LocalTrackBackend>,
    ) -> Result<Arc<dyn RtpSenderBackend>> {
        let local = RtcLocalTrack::downcast(track.as_ref())?;
        let kind = local.kind;
        let sender = self
            .pc
            .add_track(local.track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| AppError::Engine(format!("Failed to add {} track: {}", kind, e)))?;
        Ok(Arc::new(RtcSender { sender, kind }))
    }

    async fn senders(&self) -> Vec<Arc<dyn RtpSenderBackend>> {
        let mut senders: Vec<Arc<dyn RtpSenderBackend>> = Vec::new();
        for transceiver in self.pc.get_transceivers().await {
            let Some(kind) = media_kind(transceiver.kind()) else {
                continue;
            };
            if !is_sending(transceiver.direction()) {
                continue;
            }
            senders.push(Arc::new(RtcSender {
                sender: transceiver.sender().await,
                kind,
            }));
        }
        senders
    }

    async fn remove_track(&self, sender: Arc<dyn RtpSenderBackend>) -> Result<()> {
        let sender = sender
            .as_any()
            .downcast_ref::<RtcSender>()
            .ok_or_else(|| AppError::Engine("Sender belongs to another engine".to_string()))?;
        self.pc
            .remove_track(&sender.sender)
            .await
            .map_err(|e| AppError::Engine(format!("Failed to remove track: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        self.pc
            .close()
            .await
            .map_err(|e| AppError::Engine(format!("Failed to close peer connection: {}", e)))
    }
}

/// RTP sender wrapper
pub struct RtcSender {
    sender: Arc<RTCRtpSender>,
    kind: MediaKind,
}

#[async_trait]
impl RtpSenderBackend for RtcSender {
    async fn track_id(&self) -> Option<String> {
        self.sender.track().await.map(|t| t.id().to_string())
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn replace_track(&self, track: Arc<dyn LocalTrackBackend>) -> Result<()> {
        let local = RtcLocalTrack::downcast(track.as_ref())?;
        self.sender
            .replace_track(Some(local.track.clone() as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| AppError::Engine(format!("Failed to replace track: {}", e)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Local track fed by an external capture source
pub struct RtcLocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl RtcLocalTrack {
    fn new(id: &str, kind: MediaKind, codec: RTCRtpCodecCapability) -> Self {
        Self {
            id: id.to_string(),
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                codec,
                id.to_string(),
                LOCAL_STREAM_ID.to_string(),
            )),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    fn downcast(track: &dyn LocalTrackBackend) -> Result<&RtcLocalTrack> {
        track
            .as_any()
            .downcast_ref::<RtcLocalTrack>()
            .ok_or_else(|| AppError::Engine(format!("Track {} belongs to another engine", track.id())))
    }

    /// Push one encoded sample; dropped while disabled or stopped
    pub async fn write_sample(&self, sample: &Sample) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) || !self.enabled.load(Ordering::SeqCst) {
            trace!("Dropping sample for inactive track {}", self.id);
            return Ok(());
        }
        self.track
            .write_sample(sample)
            .await
            .map_err(|e| AppError::Engine(format!("Failed to write sample: {}", e)))
    }
}

impl LocalTrackBackend for RtcLocalTrack {
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

/// Data channel wrapper
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
    events: RwLock<Option<Arc<ChannelEventSlots>>>,
}

impl RtcDataChannel {
    fn new(dc: Arc<RTCDataChannel>) -> Self {
        Self {
            label: dc.label().to_string(),
            dc,
            events: RwLock::new(None),
        }
    }
}

#[async_trait]
impl DataChannelBackend for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> Option<u16> {
        Some(self.dc.id())
    }

    fn ready_state(&self) -> DataChannelState {
        channel_state(self.dc.ready_state())
    }

    async fn send(&self, frame: DataFrame) -> Result<()> {
        let sent = if frame.binary {
            self.dc.send(&frame.data).await
        } else {
            self.dc
                .send_text(String::from_utf8_lossy(&frame.data).into_owned())
                .await
        };
        sent.map(|n| trace!("Sent {} bytes on {}", n, self.label))
            .map_err(|e| AppError::Engine(format!("Failed to send on {}: {}", self.label, e)))
    }

    async fn close(&self) -> Result<()> {
        if matches!(
            self.ready_state(),
            DataChannelState::Closing | DataChannelState::Closed
        ) {
            return Ok(());
        }
        // The native stack reports close but not the closing transition
        let events = self.events.read().clone();
        if let Some(events) = events {
            events.state_change(DataChannelState::Closing);
        }
        self.dc
            .close()
            .await
            .map_err(|e| AppError::Engine(format!("Failed to close {}: {}", self.label, e)))
    }

    fn attach_events(&self, events: Arc<ChannelEventSlots>) {
        *self.events.write() = Some(events.clone());

        let slots = events.clone();
        self.dc.on_open(Box::new(move || {
            Box::pin(async move {
                slots.state_change(DataChannelState::Open);
            })
        }));

        let slots = events.clone();
        self.dc.on_close(Box::new(move || {
            let slots = slots.clone();
            Box::pin(async move {
                slots.state_change(DataChannelState::Closed);
            })
        }));

        let slots = events;
        self.dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let slots = slots.clone();
            Box::pin(async move {
                slots.message(DataFrame {
                    data: msg.data,
                    binary: !msg.is_string,
                });
            })
        }));
    }
}
