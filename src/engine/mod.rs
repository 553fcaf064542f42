//! Native WebRTC engine interfaces
//!
//! The session layer never touches a concrete engine. It talks to:
//! - [`RtcEngine`]: factory for peer connections, capture tracks and device lists
//! - [`PeerConnectionBackend`]: one peer connection
//! - [`DataChannelBackend`], [`RtpSenderBackend`], [`LocalTrackBackend`]: sub-resources
//!
//! Engine callbacks are delivered through [`PeerEventSlots`] and
//! [`ChannelEventSlots`], fixed sets of handler slots that the session can
//! clear in one step before it releases anything.
//!
//! Implementations:
//! - [`rtc::WebRtcEngine`] on top of the `webrtc` crate
//! - [`memory::MemoryEngine`], an in-process engine whose peers pair through
//!   offer/answer (tests and the loopback CLI)

pub mod memory;
pub mod rtc;

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::IceServer;
use crate::error::Result;
use crate::media::{MediaDeviceInfo, MediaKind};
use crate::webrtc::signaling::{ConnectionState, IceCandidate, OfferOptions, SdpDescription};

/// Peer connection construction parameters
#[derive(Debug, Clone, Default)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
}

/// Engine-level data channel parameters (already validated)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DataChannelInit {
    pub ordered: bool,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: Option<String>,
    /// Out-of-band negotiated stream id
    pub negotiated_id: Option<u16>,
}

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl std::fmt::Display for DataChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataChannelState::Connecting => write!(f, "connecting"),
            DataChannelState::Open => write!(f, "open"),
            DataChannelState::Closing => write!(f, "closing"),
            DataChannelState::Closed => write!(f, "closed"),
        }
    }
}

/// One data channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    pub data: Bytes,
    pub binary: bool,
}

impl DataFrame {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(text.into()),
            binary: false,
        }
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            binary: true,
        }
    }
}

/// Remote media track announced by the engine
///
/// Views hold a clone of this as a non-owning binding; the engine owns the
/// underlying stream.
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    /// Engine-specific stream handle (e.g. `webrtc::track::track_remote::TrackRemote`)
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl RemoteTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: id.into(),
            kind,
            handle,
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Engine factory
#[async_trait]
pub trait RtcEngine: Send + Sync {
    /// Engine name for logging
    fn name(&self) -> &'static str;

    /// Create a unified-plan peer connection; callbacks go to `events`
    async fn create_peer_connection(
        &self,
        config: &PeerConfig,
        events: Arc<PeerEventSlots>,
    ) -> Result<Arc<dyn PeerConnectionBackend>>;

    async fn audio_input_devices(&self) -> Result<Vec<MediaDeviceInfo>>;

    async fn video_input_devices(&self) -> Result<Vec<MediaDeviceInfo>>;

    /// Start microphone capture and wrap it in a track
    async fn create_audio_track(
        &self,
        track_id: &str,
        device_id: Option<&str>,
    ) -> Result<Arc<dyn LocalTrackBackend>>;

    /// Start camera capture on `device` and wrap it in a track
    async fn create_video_track(
        &self,
        track_id: &str,
        device: &MediaDeviceInfo,
    ) -> Result<Arc<dyn LocalTrackBackend>>;
}

/// One native peer connection
#[async_trait]
pub trait PeerConnectionBackend: Send + Sync {
    async fn set_local_description(&self, desc: SdpDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SdpDescription) -> Result<()>;

    async fn create_offer(&self, options: &OfferOptions) -> Result<SdpDescription>;

    async fn create_answer(&self, options: &OfferOptions) -> Result<SdpDescription>;

    async fn has_remote_description(&self) -> bool;

    fn connection_state(&self) -> ConnectionState;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(
        &self,
        label: &str,
        init: &DataChannelInit,
    ) -> Result<Arc<dyn DataChannelBackend>>;

    async fn add_track(&self, track: Arc<dyn LocalTrackBackend>)
        -> Result<Arc<dyn RtpSenderBackend>>;

    async fn senders(&self) -> Vec<Arc<dyn RtpSenderBackend>>;

    async fn remove_track(&self, sender: Arc<dyn RtpSenderBackend>) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Outbound RTP sender
#[async_trait]
pub trait RtpSenderBackend: Send + Sync {
    /// Id of the bound local track, if any
    async fn track_id(&self) -> Option<String>;

    fn kind(&self) -> MediaKind;

    /// Swap the bound track in place without renegotiation
    async fn replace_track(&self, track: Arc<dyn LocalTrackBackend>) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Local capture track
pub trait LocalTrackBackend: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn enabled(&self) -> bool;

    /// Mute/unmute without renegotiation
    fn set_enabled(&self, enabled: bool);

    /// Stop capture and release the source
    fn stop(&self);

    fn as_any(&self) -> &dyn Any;
}

/// Native data channel
#[async_trait]
pub trait DataChannelBackend: Send + Sync {
    fn label(&self) -> &str;

    fn id(&self) -> Option<u16>;

    fn ready_state(&self) -> DataChannelState;

    async fn send(&self, frame: DataFrame) -> Result<()>;

    async fn close(&self) -> Result<()>;

    /// Route message and state callbacks to `events`
    fn attach_events(&self, events: Arc<ChannelEventSlots>);
}

pub type IceCandidateHandler = Box<dyn Fn(IceCandidate) + Send + Sync>;
pub type ConnectionStateHandler = Box<dyn Fn(ConnectionState) + Send + Sync>;
pub type RemoteTrackHandler = Box<dyn Fn(RemoteTrack) + Send + Sync>;
pub type DataChannelHandler = Box<dyn Fn(Arc<dyn DataChannelBackend>) + Send + Sync>;
pub type MessageHandler = Box<dyn Fn(DataFrame) + Send + Sync>;
pub type ChannelStateHandler = Box<dyn Fn(DataChannelState) + Send + Sync>;

/// Peer connection callbacks, registered once per session
#[derive(Default)]
pub struct PeerEventHandlers {
    pub on_ice_candidate: Option<IceCandidateHandler>,
    pub on_connection_state: Option<ConnectionStateHandler>,
    pub on_remote_track: Option<RemoteTrackHandler>,
    pub on_data_channel: Option<DataChannelHandler>,
}

/// Handler slots the engine adapter dispatches into
pub struct PeerEventSlots {
    handlers: RwLock<PeerEventHandlers>,
}

impl PeerEventSlots {
    pub fn new(handlers: PeerEventHandlers) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(handlers),
        })
    }

    /// Slots with nothing registered
    pub fn empty() -> Arc<Self> {
        Self::new(PeerEventHandlers::default())
    }

    pub fn ice_candidate(&self, candidate: IceCandidate) {
        if let Some(handler) = self.handlers.read().on_ice_candidate.as_ref() {
            handler(candidate);
        }
    }

    pub fn connection_state(&self, state: ConnectionState) {
        if let Some(handler) = self.handlers.read().on_connection_state.as_ref() {
            handler(state);
        }
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        if let Some(handler) = self.handlers.read().on_remote_track.as_ref() {
            handler(track);
        }
    }

    pub fn data_channel(&self, channel: Arc<dyn DataChannelBackend>) {
        if let Some(handler) = self.handlers.read().on_data_channel.as_ref() {
            handler(channel);
        }
    }

    /// Deregister every handler; later engine callbacks become no-ops
    pub fn clear(&self) {
        *self.handlers.write() = PeerEventHandlers::default();
    }

    pub fn is_cleared(&self) -> bool {
        let handlers = self.handlers.read();
        handlers.on_ice_candidate.is_none()
            && handlers.on_connection_state.is_none()
            && handlers.on_remote_track.is_none()
            && handlers.on_data_channel.is_none()
    }
}

/// Per-channel callbacks
#[derive(Default)]
pub struct ChannelEventHandlers {
    pub on_message: Option<MessageHandler>,
    pub on_state_change: Option<ChannelStateHandler>,
}

/// Handler slots for one data channel
pub struct ChannelEventSlots {
    handlers: RwLock<ChannelEventHandlers>,
}

impl ChannelEventSlots {
    pub fn new(handlers: ChannelEventHandlers) -> Arc<Self> {
        Arc::new(Self {
            handlers: RwLock::new(handlers),
        })
    }

    pub fn message(&self, frame: DataFrame) {
        if let Some(handler) = self.handlers.read().on_message.as_ref() {
            handler(frame);
        }
    }

    pub fn state_change(&self, state: DataChannelState) {
        if let Some(handler) = self.handlers.read().on_state_change.as_ref() {
            handler(state);
        }
    }

    pub fn clear(&self) {
        *self.handlers.write() = ChannelEventHandlers::default();
    }
}
