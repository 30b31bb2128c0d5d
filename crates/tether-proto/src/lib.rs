//! Wire format for the tether management channel.
//!
//! Every frame exchanged with the control service over the push session is a
//! binary WebSocket message with a fixed 3-byte header followed by an opaque
//! payload:
//!
//! ```text
//!  0              1                2              3 ...
//! ┌──────────────┬────────────────┬──────────────┬──────────────────────┐
//! │ message type │ channel number │    target    │       payload        │
//! └──────────────┴────────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! - Overlay and metrics frames carry JSON text.
//! - Channel payload frames carry raw tunnel bytes.
//! - Channel close frames carry nothing.
//!
//! The channel number is only meaningful for [`MessageType::ChannelClose`] and
//! [`MessageType::ChannelPayload`]; every other frame uses channel 0. The target
//! byte is a routing hint for the control service and is always
//! [`TARGET_ANY`] on frames produced here.
//!
//! # Example
//!
//! ```
//! use tether_proto::{ChannelMessage, MessageType};
//!
//! let frame = tether_proto::encode_metrics_report(br#"{"a":1}"#);
//! let msg = ChannelMessage::decode(&frame).unwrap();
//! assert_eq!(msg.message_type, MessageType::MetricsReport);
//! assert_eq!(msg.channel_number, 0);
//! assert_eq!(msg.payload, br#"{"a":1}"#);
//! ```

#![deny(missing_docs)]

use thiserror::Error;

/// WebSocket sub-protocol announced when opening the push session
pub const PROTOCOL_NAME: &str = "zenko-secure-channel-v0";

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 3;

/// Target value meaning "any service"; the only value currently produced
pub const TARGET_ANY: u8 = 0;

/// Kind of a channel message, carried in the first header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Control service pushes a configuration overlay (JSON payload)
    ConfigOverlay,
    /// Control service asks for a fresh metrics report (empty payload)
    MetricsRequest,
    /// Instance sends its metrics report (JSON payload)
    MetricsReport,
    /// Either side closes a virtual channel (empty payload)
    ChannelClose,
    /// Either side sends bytes on a virtual channel
    ChannelPayload,
    /// A type this build does not understand
    Unknown(u8),
}

impl MessageType {
    /// Wire value of this message type
    pub fn as_u8(self) -> u8 {
        match self {
            MessageType::ConfigOverlay => 1,
            MessageType::MetricsRequest => 2,
            MessageType::MetricsReport => 3,
            MessageType::ChannelClose => 4,
            MessageType::ChannelPayload => 5,
            MessageType::Unknown(value) => value,
        }
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageType::ConfigOverlay,
            2 => MessageType::MetricsRequest,
            3 => MessageType::MetricsReport,
            4 => MessageType::ChannelClose,
            5 => MessageType::ChannelPayload,
            other => MessageType::Unknown(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::ConfigOverlay => write!(f, "CONFIG_OVERLAY"),
            MessageType::MetricsRequest => write!(f, "METRICS_REQUEST"),
            MessageType::MetricsReport => write!(f, "METRICS_REPORT"),
            MessageType::ChannelClose => write!(f, "CHANNEL_CLOSE"),
            MessageType::ChannelPayload => write!(f, "CHANNEL_PAYLOAD"),
            MessageType::Unknown(value) => write!(f, "UNKNOWN({})", value),
        }
    }
}

/// Errors produced while decoding a frame
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame is shorter than the fixed header
    #[error("frame too short: {len} bytes, header needs 3")]
    FrameTooShort {
        /// Length of the rejected frame
        len: usize,
    },
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Message kind
    pub message_type: MessageType,
    /// Virtual channel the frame belongs to (0 when not channel related)
    pub channel_number: u8,
    /// Service routing hint
    pub target: u8,
    /// Raw payload bytes
    pub payload: Vec<u8>,
}

impl ChannelMessage {
    /// Decode a frame received from the transport.
    ///
    /// Only the header length is checked; the payload is taken as-is.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < HEADER_LEN {
            return Err(DecodeError::FrameTooShort { len: frame.len() });
        }
        Ok(Self {
            message_type: MessageType::from(frame[0]),
            channel_number: frame[1],
            target: frame[2],
            payload: frame[HEADER_LEN..].to_vec(),
        })
    }

    /// Encode this message back into its wire form
    pub fn encode(&self) -> Vec<u8> {
        encode_frame(self.message_type, self.channel_number, self.target, &self.payload)
    }

    /// Payload interpreted as UTF-8 text, replacing invalid sequences
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

fn encode_frame(message_type: MessageType, channel_number: u8, target: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.push(message_type.as_u8());
    frame.push(channel_number);
    frame.push(target);
    frame.extend_from_slice(payload);
    frame
}

/// Encode an arbitrary frame addressed to [`TARGET_ANY`]
pub fn encode(message_type: MessageType, channel_number: u8, payload: &[u8]) -> Vec<u8> {
    encode_frame(message_type, channel_number, TARGET_ANY, payload)
}

/// Encode a close notification for a virtual channel
pub fn encode_close(channel_number: u8) -> Vec<u8> {
    encode(MessageType::ChannelClose, channel_number, &[])
}

/// Encode tunnel bytes for a virtual channel
pub fn encode_data(channel_number: u8, data: &[u8]) -> Vec<u8> {
    encode(MessageType::ChannelPayload, channel_number, data)
}

/// Encode a metrics report carrying the raw JSON body of the local stats endpoint
pub fn encode_metrics_report(body: &[u8]) -> Vec<u8> {
    encode(MessageType::MetricsReport, 0, body)
}

/// Encode a configuration overlay push (control-service side)
pub fn encode_overlay(json: &[u8]) -> Vec<u8> {
    encode(MessageType::ConfigOverlay, 0, json)
}

/// Encode a metrics request (control-service side)
pub fn encode_metrics_request() -> Vec<u8> {
    encode(MessageType::MetricsRequest, 0, &[])
}
