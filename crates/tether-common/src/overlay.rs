//! Configuration overlay documents
//!
//! An overlay is the versioned configuration document published by the
//! control service. Only the fields reconciliation applies are typed; every
//! other field is carried through `extra` so a persisted or relayed overlay
//! is byte-for-byte the document that was received, modulo key order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Versioned configuration document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigOverlay {
    /// Monotonic version; absent until the control service publishes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,

    /// Public identifier of the instance as known by the control service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Accounts to provision
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub users: Vec<OverlayUser>,

    /// Hostname to location routing entries
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<OverlayEndpoint>,

    /// Storage locations keyed by location name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locations: BTreeMap<String, OverlayLocation>,

    /// Browser access (tunnel) switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser_access: Option<BrowserAccess>,

    /// Fields this build does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConfigOverlay {
    /// The empty overlay `{}`
    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse an overlay from JSON bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Whether the document carries a version
    pub fn has_version(&self) -> bool {
        self.version.is_some()
    }

    /// Whether this overlay should replace `cached` in the store.
    ///
    /// True when this overlay has a version and `cached` is absent, has no
    /// version, or has a strictly lower one.
    pub fn is_newer_than(&self, cached: Option<&ConfigOverlay>) -> bool {
        match (self.version, cached.and_then(|c| c.version)) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(remote), Some(local)) => remote > local,
        }
    }

    /// Desired browser-access state, if the overlay sets one
    pub fn browser_access_enabled(&self) -> Option<bool> {
        self.browser_access.as_ref().map(|b| b.enabled)
    }
}

/// One account entry of an overlay
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayUser {
    /// Access key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,

    /// Base64 RSA-OAEP ciphertext of the secret key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,

    /// Canonical id of the account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_id: Option<String>,

    /// Account type, e.g. `service-replication`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_type: Option<String>,

    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    /// Fields this build does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OverlayUser {
    /// Encrypted secret, when present and non-empty
    pub fn encrypted_secret(&self) -> Option<&str> {
        self.secret_key.as_deref().filter(|s| !s.is_empty())
    }

    /// Service name for accounts typed `service-<name>`
    pub fn service_name(&self) -> Option<&str> {
        let account_type = self.account_type.as_deref()?;
        let rest = account_type.strip_prefix("service-")?;
        // only the segment up to the next dash names the service
        rest.split('-').next().filter(|s| !s.is_empty())
    }
}

/// Routes requests for a hostname to a location
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayEndpoint {
    /// Hostname clients address
    #[serde(default)]
    pub hostname: String,

    /// Location name serving that hostname
    #[serde(default)]
    pub location_name: String,

    /// Fields this build does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Location entry of an overlay, before type dispatch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayLocation {
    /// Location type tag, e.g. `location-aws-s3-v1`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location_type: String,

    /// Control-service identifier of the location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// Type-specific details; secrets inside are encrypted
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub details: Map<String, Value>,

    /// Capacity limit in GB
    #[serde(
        rename = "sizeLimitGB",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub size_limit_gb: Option<u64>,

    /// Transient source location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_transient: Option<bool>,

    /// Legacy AWS location behavior
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_aws_behavior: Option<bool>,

    /// Fields this build does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl OverlayLocation {
    /// String field of `details`, empty strings treated as absent
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.details
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Boolean field of `details`, using JavaScript-style truthiness
    pub fn detail_flag(&self, key: &str) -> bool {
        match self.details.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(_)) | Some(Value::Object(_)) => true,
        }
    }
}

/// Browser access switch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrowserAccess {
    /// Whether tunneled browser access is allowed
    #[serde(default)]
    pub enabled: bool,

    /// Fields this build does not interpret
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}
