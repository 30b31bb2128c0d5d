//! Live runtime configuration
//!
//! [`RuntimeConfig`] is the in-process view of everything an overlay
//! controls. [`LiveConfig`] owns the current value: readers take a cheap
//! `Arc` snapshot, the reconciler publishes a whole new value in one swap, so
//! no reader observes a half-applied overlay.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::location::LocationConstraint;

/// Hostname always routed, unless an overlay says otherwise
pub const REPLICATOR_ENDPOINT: &str = "zenko-cloudserver-replicator";

/// Location the replicator hostname routes to by default
pub const REPLICATOR_DEFAULT_LOCATION: &str = "us-east-1";

/// Short id shared by every overlay-provisioned account
pub const ACCOUNT_SHORT_ID: &str = "123456789012";

/// Canonical id used when an overlay user omits one
pub const DEFAULT_CANONICAL_ID: &str =
    "79a59df900b949e55d96a1e698fbacedfd6e09d98eacf8f8d5218e7cd47ef2be";

const DEFAULT_ACCOUNT_NAME: &str = "CustomAccount";
const DEFAULT_ACCOUNT_EMAIL: &str = "customaccount1@setbyenv.com";

/// Access key pair of an account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessKeyPair {
    /// Access key id
    pub access: String,
    /// Decrypted secret key
    pub secret: String,
}

impl fmt::Debug for AccessKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessKeyPair")
            .field("access", &self.access)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Account provisioned from an overlay user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAccount {
    /// Display name
    pub name: String,
    /// Contact email
    pub email: String,
    /// Account ARN
    pub arn: String,
    /// Canonical id
    #[serde(rename = "canonicalID")]
    pub canonical_id: String,
    /// Short (12 digit) id
    #[serde(rename = "shortid")]
    pub short_id: String,
    /// Key pairs accepted for this account
    pub keys: Vec<AccessKeyPair>,
    /// Internal service this account belongs to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl AuthAccount {
    /// Build an account from one overlay user and its decrypted secret
    pub fn new(
        access_key: &str,
        secret_key: &str,
        canonical_id: Option<&str>,
        service_name: Option<&str>,
        user_name: Option<&str>,
    ) -> Self {
        Self {
            name: user_name
                .filter(|n| !n.is_empty())
                .unwrap_or(DEFAULT_ACCOUNT_NAME)
                .to_string(),
            email: DEFAULT_ACCOUNT_EMAIL.to_string(),
            arn: format!("arn:aws:iam::{}:root", ACCOUNT_SHORT_ID),
            canonical_id: canonical_id
                .filter(|c| !c.is_empty())
                .unwrap_or(DEFAULT_CANONICAL_ID)
                .to_string(),
            short_id: ACCOUNT_SHORT_ID.to_string(),
            keys: vec![AccessKeyPair {
                access: access_key.to_string(),
                secret: secret_key.to_string(),
            }],
            service_name: service_name.map(str::to_string),
        }
    }
}

/// Everything an overlay controls, as one immutable value
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Version of the last applied overlay
    pub overlay_version: Option<u64>,
    /// Overlay-provisioned accounts
    pub accounts: Vec<AuthAccount>,
    /// Hostname to location routing table
    pub rest_endpoints: BTreeMap<String, String>,
    /// Locations by name
    pub location_constraints: BTreeMap<String, LocationConstraint>,
    /// Locations usable as replication targets, by name
    pub replication_endpoints: BTreeMap<String, LocationConstraint>,
    /// Public instance identifier
    pub public_instance_id: Option<String>,
    /// Whether tunneled browser access is allowed
    pub browser_access_enabled: bool,
}

impl RuntimeConfig {
    /// Configuration seeded with the given hostname routing table
    pub fn with_rest_endpoints(rest_endpoints: BTreeMap<String, String>) -> Self {
        Self {
            rest_endpoints,
            ..Default::default()
        }
    }
}

/// Owner of the live [`RuntimeConfig`]
pub struct LiveConfig {
    current: RwLock<Arc<RuntimeConfig>>,
    browser_access: watch::Sender<bool>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl LiveConfig {
    /// Wrap an initial configuration
    pub fn new(initial: RuntimeConfig) -> Self {
        let (browser_access, _) = watch::channel(initial.browser_access_enabled);
        Self {
            current: RwLock::new(Arc::new(initial)),
            browser_access,
        }
    }

    /// Current configuration
    pub fn snapshot(&self) -> Arc<RuntimeConfig> {
        self.current.read().clone()
    }

    /// Publish a new configuration, returning the previous one.
    ///
    /// Browser-access subscribers are notified only when the flag changes.
    pub fn replace(&self, next: RuntimeConfig) -> Arc<RuntimeConfig> {
        let enabled = next.browser_access_enabled;
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(next));
        self.browser_access.send_if_modified(|current| {
            if *current == enabled {
                false
            } else {
                *current = enabled;
                true
            }
        });
        previous
    }

    /// Version of the last applied overlay
    pub fn overlay_version(&self) -> Option<u64> {
        self.current.read().overlay_version
    }

    /// Whether tunneled browser access is currently allowed
    pub fn browser_access_enabled(&self) -> bool {
        *self.browser_access.borrow()
    }

    /// Watch the browser-access flag
    pub fn subscribe_browser_access(&self) -> watch::Receiver<bool> {
        self.browser_access.subscribe()
    }
}

impl fmt::Debug for LiveConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveConfig")
            .field("current", &self.snapshot())
            .finish()
    }
}
