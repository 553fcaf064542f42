//! WebRTC session orchestration
//!
//! Architecture:
//! ```text
//! Application (commands / events)
//!        |
//!        v
//! SessionController ---- EventBus ----> iceCandidate, connectionState,
//!   |    |    |                         dataChannel, dataChannelMessage,
//!   |    |    |                         dataChannelState
//!   |    |    +-- ViewRegistry ------> SurfaceFactory (platform)
//!   |    +------- DataChannelRegistry
//!   +------------ TrackRegistry
//!        |
//!        v
//! PeerConnectionBackend (webrtc crate or in-memory engine)
//! ```

pub mod data_channel;
pub mod negotiation;
pub mod session;
pub mod signaling;
pub mod view;

pub use data_channel::{
    ChannelPayload, CreateDataChannelOptions, CreateDataChannelRequest, SendDataRequest,
};
pub use negotiation::{CandidateOutcome, NegotiationEngine, NegotiationStats};
pub use session::SessionController;
pub use signaling::{ConnectionState, IceCandidate, OfferOptions, SdpDescription, SdpType};
pub use view::{CreateVideoViewRequest, FitMode, UpdateVideoViewRequest, ViewGeometry};
