//! JSON bodies exchanged with the control service and relay clients

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::overlay::ConfigOverlay;

/// Body of `POST /{instanceId}/register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    /// PEM SubjectPublicKeyInfo of the freshly generated key
    pub public_key: String,
}

/// Successful (201) answer to a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    /// Instance token
    pub token: String,
    /// Token serial number
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<u64>,
    /// Public key echoed back by the control service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Issue time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_date: Option<IssueDate>,
    /// Any other fields, persisted with the credentials
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Token issue time, as milliseconds since the Unix epoch or an RFC 3339 string
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IssueDate {
    /// Milliseconds since the Unix epoch
    Millis(i64),
    /// RFC 3339 timestamp
    Text(String),
}

impl IssueDate {
    /// Issue date stamped now
    pub fn now() -> Self {
        IssueDate::Millis(Utc::now().timestamp_millis())
    }

    /// Issue time as a UTC timestamp, if it can be interpreted
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            IssueDate::Millis(ms) => DateTime::from_timestamp_millis(*ms),
            IssueDate::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

/// Body of `POST /{instanceId}/confirm`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    /// Serial of the token being confirmed (0 when the service gave none)
    pub serial: u64,
    /// Public key the token was issued for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

/// Relay message type announcing an overlay
pub const NEW_OVERLAY: &str = "NEW_OVERLAY";

/// Text frame sent by the relay to its subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayEnvelope {
    /// Always [`NEW_OVERLAY`]
    pub message_type: String,
    /// The overlay document
    pub payload: ConfigOverlay,
}

impl RelayEnvelope {
    /// Envelope announcing `overlay`
    pub fn new_overlay(overlay: ConfigOverlay) -> Self {
        Self {
            message_type: NEW_OVERLAY.to_string(),
            payload: overlay,
        }
    }
}
