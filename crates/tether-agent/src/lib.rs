//! Tether agent - management channel of an S3 gateway instance
//!
//! The agent keeps an instance in sync with its remote control service:
//!
//! - [`credentials`]: RSA keypair, registration and token handling
//! - [`reconciler`]: applies configuration overlays to the live configuration
//! - [`push`]: WebSocket session with overlay pushes, metrics and TCP tunnels
//! - [`poll`]: HTTP polling fallback
//! - [`bootstrap`]: startup sequence tying the above together

pub mod api;
pub mod bootstrap;
pub mod credentials;
pub mod locations;
pub mod poll;
pub mod push;
pub mod reconciler;
pub mod stats;
pub mod tunnel;

pub use api::{ControlApi, HttpControlApi, SharedControlApi};
pub use bootstrap::{BootstrapOutcome, ManagementAgent};
pub use credentials::{CredentialManager, Credentials};
pub use poll::PollClient;
pub use push::{PushClient, SessionEnd, SessionState};
pub use reconciler::{PatchOutcome, Reconciler};
pub use stats::{HttpStatsSource, SharedStatsSource, StatsSource};
pub use tunnel::ChannelRegistry;
