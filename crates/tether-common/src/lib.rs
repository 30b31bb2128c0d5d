//! Common types for tether: errors, the store interface, live configuration,
//! settings and telemetry.
//!
//! Everything in here is shared between the agent (bootstrap, reconciler,
//! transports) and the relay process.

#![deny(missing_docs)]

pub mod error;
pub mod location;
pub mod overlay;
pub mod protocol;
pub mod retry;
pub mod runtime;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub use overlay::ConfigOverlay;
pub use runtime::{LiveConfig, RuntimeConfig};
pub use store::{MetadataStore, SharedStore, StoreError};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Bucket of the persistent store holding credentials and overlay history
pub const MANAGEMENT_DATABASE: &str = "PENSIEVE";

/// Key of the stored instance credentials
pub const CREDENTIALS_KEY: &str = "auth/zenko/remote-management-token";

/// Key of the pointer to the latest cached overlay version
pub const OVERLAY_VERSION_KEY: &str = "configuration/overlay-version";

/// Prefix of the versioned overlay documents
pub const OVERLAY_KEY_PREFIX: &str = "configuration/overlay";

/// Key of the persisted instance identifier
pub const INSTANCE_ID_KEY: &str = "configuration/instance-id";

/// Key under which overlay version `version` is stored
pub fn overlay_key(version: u64) -> String {
    format!("{}/{}", OVERLAY_KEY_PREFIX, version)
}

/// Header carrying the instance token on every control-service call
pub const AUTH_TOKEN_HEADER: &str = "x-instance-authentication-token";

/// Header carrying the report token on local stats requests
pub const REPORT_TOKEN_HEADER: &str = "x-scal-report-token";

/// Header asking the local stats endpoint to bypass its cache
pub const REPORT_SKIP_CACHE_HEADER: &str = "x-scal-report-skip-cache";
