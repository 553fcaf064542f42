//! Data channel registry and frame translation
//!
//! Channels are keyed by label. Binary frames travel to and from the
//! application as standard base64; text frames are UTF-8 strings.

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::engine::{
    ChannelEventHandlers, ChannelEventSlots, DataChannelBackend, DataChannelInit, DataChannelState,
    DataFrame,
};
use crate::error::{AppError, Result};
use crate::events::{EventSink, SessionEvent};

/// `createDataChannel` options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateDataChannelOptions {
    /// Defaults to true
    pub ordered: Option<bool>,
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: Option<String>,
    /// Defaults to false; requires `id`
    pub negotiated: Option<bool>,
    pub id: Option<u16>,
}

impl CreateDataChannelOptions {
    /// Validate and convert to engine parameters
    pub fn to_init(&self) -> Result<DataChannelInit> {
        if self.max_packet_life_time.is_some() && self.max_retransmits.is_some() {
            return Err(AppError::InvalidArgument(
                "maxPacketLifeTime and maxRetransmits are mutually exclusive".to_string(),
            ));
        }

        let negotiated_id = match (self.negotiated.unwrap_or(false), self.id) {
            (true, Some(id)) => Some(id),
            (true, None) => return Err(AppError::MissingArgument("id")),
            (false, Some(id)) => {
                return Err(AppError::InvalidArgument(format!(
                    "id {} requires negotiated=true",
                    id
                )))
            }
            (false, None) => None,
        };

        Ok(DataChannelInit {
            ordered: self.ordered.unwrap_or(true),
            max_packet_life_time: self.max_packet_life_time,
            max_retransmits: self.max_retransmits,
            protocol: self.protocol.clone().filter(|p| !p.is_empty()),
            negotiated_id,
        })
    }
}

/// `createDataChannel` request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDataChannelRequest {
    pub label: String,
    #[serde(flatten)]
    pub options: CreateDataChannelOptions,
}

impl CreateDataChannelRequest {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            options: CreateDataChannelOptions::default(),
        }
    }

    pub fn negotiated(mut self, id: u16) -> Self {
        self.options.negotiated = Some(true);
        self.options.id = Some(id);
        self
    }
}

/// Payload accepted by `sendData`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelPayload {
    Text(String),
    Bytes(Vec<u8>),
    Base64 { base64: String },
    Other(serde_json::Value),
}

impl From<&str> for ChannelPayload {
    fn from(s: &str) -> Self {
        ChannelPayload::Text(s.to_string())
    }
}

impl From<Vec<u8>> for ChannelPayload {
    fn from(bytes: Vec<u8>) -> Self {
        ChannelPayload::Bytes(bytes)
    }
}

/// `sendData` request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendDataRequest {
    pub channel_id: String,
    pub data: ChannelPayload,
    #[serde(default)]
    pub binary: bool,
}

impl SendDataRequest {
    pub fn text(channel_id: impl Into<String>, text: &str) -> Self {
        Self {
            channel_id: channel_id.into(),
            data: text.into(),
            binary: false,
        }
    }

    pub fn binary(channel_id: impl Into<String>, data: impl Into<ChannelPayload>) -> Self {
        Self {
            channel_id: channel_id.into(),
            data: data.into(),
            binary: true,
        }
    }
}

fn decode_base64(encoded: &str) -> Result<Bytes> {
    STANDARD
        .decode(encoded.trim())
        .map(Bytes::from)
        .map_err(|e| AppError::EncodingError(format!("invalid base64 payload: {}", e)))
}

/// Turn an application payload into a wire frame
pub fn encode_outbound(payload: ChannelPayload, binary: bool) -> Result<DataFrame> {
    if binary {
        let data = match payload {
            ChannelPayload::Text(encoded) => decode_base64(&encoded)?,
            ChannelPayload::Base64 { base64 } => decode_base64(&base64)?,
            ChannelPayload::Bytes(bytes) => Bytes::from(bytes),
            ChannelPayload::Other(value) => {
                return Err(AppError::EncodingError(format!(
                    "binary payload must be a base64 string or byte array, got {}",
                    value
                )))
            }
        };
        return Ok(DataFrame::binary(data));
    }

    let text = match payload {
        ChannelPayload::Text(text) => text,
        other => serde_json::to_string(&other)?,
    };
    Ok(DataFrame::text(text))
}

/// Turn a received frame into `(data, binary)` for the application
pub fn decode_inbound(frame: &DataFrame) -> (String, bool) {
    if frame.binary {
        (STANDARD.encode(&frame.data), true)
    } else {
        (String::from_utf8_lossy(&frame.data).into_owned(), false)
    }
}

/// Handlers that publish a channel's traffic as session events
pub fn channel_handlers(channel_id: &str, sink: EventSink) -> ChannelEventHandlers {
    let message_id = channel_id.to_string();
    let message_sink = sink.clone();
    let state_id = channel_id.to_string();

    ChannelEventHandlers {
        on_message: Some(Box::new(move |frame: DataFrame| {
            let (data, binary) = decode_inbound(&frame);
            debug!(
                "Data channel {} received {} bytes (binary={})",
                message_id,
                frame.data.len(),
                binary
            );
            message_sink.publish(SessionEvent::DataChannelMessage {
                channel_id: message_id.clone(),
                data,
                binary,
            });
        })),
        on_state_change: Some(Box::new(move |state: DataChannelState| {
            debug!("Data channel {} state: {}", state_id, state);
            sink.publish(SessionEvent::DataChannelState {
                channel_id: state_id.clone(),
                state: state.to_string(),
            });
        })),
    }
}

/// Registry entry
#[derive(Clone)]
pub struct ChannelEntry {
    pub backend: Arc<dyn DataChannelBackend>,
    pub slots: Arc<ChannelEventSlots>,
}

/// Data channels keyed by label
///
/// Registering a label twice replaces the entry (last write wins). The
/// replaced channel is no longer addressable but is still closed by
/// [`DataChannelRegistry::drain`].
#[derive(Default)]
pub struct DataChannelRegistry {
    channels: HashMap<String, ChannelEntry>,
    superseded: Vec<ChannelEntry>,
}

impl DataChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, label: &str, entry: ChannelEntry) {
        if let Some(previous) = self.channels.insert(label.to_string(), entry) {
            warn!("Data channel label {} reused; replacing registry entry", label);
            self.superseded.push(previous);
        }
    }

    pub fn get(&self, channel_id: &str) -> Result<Arc<dyn DataChannelBackend>> {
        self.channels
            .get(channel_id)
            .map(|e| e.backend.clone())
            .ok_or_else(|| AppError::unknown_channel(channel_id))
    }

    pub fn remove(&mut self, channel_id: &str) -> Option<ChannelEntry> {
        self.channels.remove(channel_id)
    }

    /// Deregister every callback without closing anything
    pub fn clear_handlers(&self) {
        for entry in self.channels.values().chain(self.superseded.iter()) {
            entry.slots.clear();
        }
    }

    /// Remove every channel, superseded ones included
    pub fn drain(&mut self) -> Vec<ChannelEntry> {
        let mut drained: Vec<ChannelEntry> = self.channels.drain().map(|(_, e)| e).collect();
        drained.append(&mut self.superseded);
        drained
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.superseded.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::MemoryEngine;
    use crate::engine::{PeerConfig, PeerEventSlots, RtcEngine};
    use crate::events::EventBus;
    use std::sync::atomic::AtomicU64;

    #[test]
    fn test_reliability_options_are_exclusive() {
        let options = CreateDataChannelOptions {
            max_packet_life_time: Some(500),
            max_retransmits: Some(3),
            ..Default::default()
        };
        assert!(matches!(options.to_init(), Err(AppError::InvalidArgument(_))));
    }

    #[test]
    fn test_negotiated_requires_id() {
        let options = CreateDataChannelOptions {
            negotiated: Some(true),
            ..Default::default()
        };
        assert!(matches!(options.to_init(), Err(AppError::MissingArgument("id"))));

        let options = CreateDataChannelOptions {
            id: Some(4),
            ..Default::default()
        };
        assert!(matches!(options.to_init(), Err(AppError::InvalidArgument(_))));

        let init = CreateDataChannelRequest::new("game")
            .negotiated(4)
            .options
            .to_init()
            .unwrap();
        assert_eq!(init.negotiated_id, Some(4));
        assert!(init.ordered);
    }

    #[test]
    fn test_request_wire_format() {
        let request: CreateDataChannelRequest = serde_json::from_str(
            r#"{"label":"telemetry","ordered":false,"maxRetransmits":0,"protocol":"json"}"#,
        )
        .unwrap();
        let init = request.options.to_init().unwrap();
        assert_eq!(request.label, "telemetry");
        assert!(!init.ordered);
        assert_eq!(init.max_retransmits, Some(0));
        assert_eq!(init.protocol.as_deref(), Some("json"));
    }

    #[test]
    fn test_binary_payload_forms() {
        let expected = DataFrame::binary(vec![1u8, 2, 3, 4, 5]);

        let frame = encode_outbound(ChannelPayload::Text("AQIDBAU=".to_string()), true).unwrap();
        assert_eq!(frame, expected);

        let frame = encode_outbound(ChannelPayload::Bytes(vec![1, 2, 3, 4, 5]), true).unwrap();
        assert_eq!(frame, expected);

        let request: SendDataRequest =
            serde_json::from_str(r#"{"channelId":"c","data":{"base64":"AQIDBAU="},"binary":true}"#)
                .unwrap();
        assert_eq!(encode_outbound(request.data, request.binary).unwrap(), expected);

        assert_eq!(decode_inbound(&expected), ("AQIDBAU=".to_string(), true));
    }

    #[test]
    fn test_bad_base64_is_encoding_error() {
        let result = encode_outbound(ChannelPayload::Text("not base64!".to_string()), true);
        assert!(matches!(result, Err(AppError::EncodingError(_))));

        let result = encode_outbound(ChannelPayload::Other(serde_json::json!(true)), true);
        assert!(matches!(result, Err(AppError::EncodingError(_))));
    }

    #[test]
    fn test_text_mode_stringifies() {
        let frame = encode_outbound(ChannelPayload::Text("hello".to_string()), false).unwrap();
        assert_eq!(decode_inbound(&frame), ("hello".to_string(), false));

        let frame =
            encode_outbound(ChannelPayload::Other(serde_json::json!({"x": 1})), false).unwrap();
        assert_eq!(frame, DataFrame::text(r#"{"x":1}"#));

        let frame = encode_outbound(ChannelPayload::Other(serde_json::json!(42)), false).unwrap();
        assert_eq!(frame, DataFrame::text("42"));
    }

    #[tokio::test]
    async fn test_registry_last_write_wins() {
        let engine = MemoryEngine::new();
        let peer = engine
            .create_peer_connection(&PeerConfig::default(), PeerEventSlots::empty())
            .await
            .unwrap();
        let bus = Arc::new(EventBus::new());
        let sink = EventSink::new(bus, Arc::new(AtomicU64::new(1)), 1);

        let mut registry = DataChannelRegistry::new();
        for _ in 0..2 {
            let backend = peer
                .create_data_channel("chat", &DataChannelInit::default())
                .await
                .unwrap();
            registry.insert(
                "chat",
                ChannelEntry {
                    backend,
                    slots: ChannelEventSlots::new(channel_handlers("chat", sink.clone())),
                },
            );
        }

        assert_eq!(registry.len(), 1);
        assert!(registry.get("chat").is_ok());
        assert!(matches!(
            registry.get("other"),
            Err(AppError::UnknownResource { kind: "channelId", .. })
        ));
        assert_eq!(registry.drain().len(), 2);
        assert!(registry.is_empty());
    }
}
