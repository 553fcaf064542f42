//! Outbound session event types
//!
//! Defines every notification the session emits toward the application.

use serde::{Deserialize, Serialize};

/// Session event enumeration
///
/// All events are tagged with their listener name for serialization.
/// The `serde(tag = "event", content = "data")` attribute creates a
/// JSON structure like:
/// ```json
/// {
///   "event": "dataChannelState",
///   "data": { "channelId": "chat", "state": "open" }
/// }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    /// Locally gathered ICE candidate, one event per candidate
    #[serde(rename = "iceCandidate")]
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
        sdp_mline_index: Option<u16>,
    },

    /// Peer connection state changed (engine state name, unfiltered)
    #[serde(rename = "connectionState")]
    ConnectionState { state: String },

    /// Remote peer opened a data channel
    #[serde(rename = "dataChannel")]
    DataChannel {
        #[serde(rename = "channelId")]
        channel_id: String,
        label: String,
    },

    /// Frame received on a data channel
    ///
    /// Binary frames carry base64 in `data`; text frames carry the UTF-8 string.
    #[serde(rename = "dataChannelMessage")]
    DataChannelMessage {
        #[serde(rename = "channelId")]
        channel_id: String,
        data: String,
        binary: bool,
    },

    /// Data channel state transition
    #[serde(rename = "dataChannelState")]
    DataChannelState {
        #[serde(rename = "channelId")]
        channel_id: String,
        /// "connecting", "open", "closing" or "closed"
        state: String,
    },
}

impl SessionEvent {
    /// Listener name the event is delivered under
    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEvent::IceCandidate { .. } => "iceCandidate",
            SessionEvent::ConnectionState { .. } => "connectionState",
            SessionEvent::DataChannel { .. } => "dataChannel",
            SessionEvent::DataChannelMessage { .. } => "dataChannelMessage",
            SessionEvent::DataChannelState { .. } => "dataChannelState",
        }
    }
}
