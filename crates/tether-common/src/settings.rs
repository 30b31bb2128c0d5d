//! Typed settings for the management channel and the relay
//!
//! The daemon fills these from flags and environment; everything below the
//! CLI consumes only these structs.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::{Error, Result};

/// Default control-service API root
pub const DEFAULT_MANAGEMENT_ENDPOINT: &str = "https://api.zenko.io/api/v1/instance";

/// Default push-service root
pub const DEFAULT_PUSH_ENDPOINT: &str = "wss://push.api.zenko.io/api/v1/instance";

/// Default port of the local S3 listener
pub const DEFAULT_S3_PORT: u16 = 8000;

/// Default relay listen port
pub const DEFAULT_RELAY_PORT: u16 = 8010;

/// Path relay clients upgrade on
pub const RELAY_WATCH_PATH: &str = "/watch";

/// Which transport keeps the instance in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ManagementMode {
    /// Long-lived WebSocket session with tunneling
    #[default]
    Push,
    /// Periodic HTTP polling, no tunneling
    Poll,
    /// Bootstrap and apply the cached overlay, start no transport
    Disabled,
}

impl FromStr for ManagementMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(ManagementMode::Push),
            "poll" => Ok(ManagementMode::Poll),
            "none" | "disabled" | "off" => Ok(ManagementMode::Disabled),
            other => Err(Error::config(format!(
                "unknown management mode '{}' (expected push, poll or none)",
                other
            ))),
        }
    }
}

impl fmt::Display for ManagementMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagementMode::Push => write!(f, "push"),
            ManagementMode::Poll => write!(f, "poll"),
            ManagementMode::Disabled => write!(f, "none"),
        }
    }
}

/// Local TCP endpoint tunneled connections are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
}

impl TunnelTarget {
    /// `host:port` form accepted by `TcpStream::connect`
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for TunnelTarget {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_S3_PORT,
        }
    }
}

/// Where and how to fetch the local stats report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSettings {
    /// Full URL of the report endpoint
    pub report_url: String,
    /// Value of the report token header
    pub report_token: String,
    /// Send stats at all (push mode only)
    pub enabled: bool,
}

impl StatsSettings {
    /// Report endpoint of the local S3 listener on `port`
    pub fn for_port(port: u16, report_token: impl Into<String>) -> Self {
        Self {
            report_url: format!("http://localhost:{}/_/report", port),
            report_token: report_token.into(),
            enabled: true,
        }
    }
}

/// Settings of the management channel
#[derive(Debug, Clone)]
pub struct ManagementSettings {
    /// Transport selection
    pub mode: ManagementMode,
    /// Control-service API root (`…/api/v1/instance`)
    pub management_endpoint: String,
    /// Push-service root; the session URL is `{root}/{instanceId}/ws`
    pub push_endpoint: String,
    /// Full push URL replacing the derived one
    pub push_url_override: Option<String>,
    /// Timeout of every control-service HTTP request
    pub request_timeout: Duration,
    /// Delay before reopening a closed push session
    pub reconnect_delay: Duration,
    /// Idle time before each liveness ping
    pub ping_interval: Duration,
    /// Time the peer has to answer a ping
    pub pong_timeout: Duration,
    /// Delay between bootstrap attempts
    pub bootstrap_retry_delay: Duration,
    /// Poll mode: remote overlay fetch period
    pub overlay_poll_interval: Duration,
    /// Poll mode: stats push period
    pub stats_push_interval: Duration,
    /// Local stats source
    pub stats: StatsSettings,
    /// Tunnel forwarding target
    pub tunnel: TunnelTarget,
}

impl Default for ManagementSettings {
    fn default() -> Self {
        Self {
            mode: ManagementMode::Push,
            management_endpoint: DEFAULT_MANAGEMENT_ENDPOINT.to_string(),
            push_endpoint: DEFAULT_PUSH_ENDPOINT.to_string(),
            push_url_override: None,
            request_timeout: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            pong_timeout: Duration::from_secs(10),
            bootstrap_retry_delay: Duration::from_secs(10),
            overlay_poll_interval: Duration::from_secs(60),
            stats_push_interval: Duration::from_secs(30),
            stats: StatsSettings::for_port(DEFAULT_S3_PORT, uuid::Uuid::new_v4().to_string()),
            tunnel: TunnelTarget::default(),
        }
    }
}

impl ManagementSettings {
    /// Control-service URL for `path` under the instance
    pub fn instance_url(&self, instance_id: &str, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.management_endpoint.trim_end_matches('/'),
            instance_id,
            path.trim_start_matches('/')
        )
    }

    /// URL of the push session for `instance_id`.
    ///
    /// `https`/`http` roots are mapped to `wss`/`ws`.
    pub fn push_url(&self, instance_id: &str) -> Result<Url> {
        let raw = match &self.push_url_override {
            Some(url) => url.clone(),
            None => format!(
                "{}/{}/ws",
                self.push_endpoint.trim_end_matches('/'),
                instance_id
            ),
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| Error::config(format!("invalid push url '{}': {}", raw, e)))?;
        let scheme = match url.scheme() {
            "https" => Some("wss"),
            "http" => Some("ws"),
            "wss" | "ws" => None,
            other => {
                return Err(Error::config(format!(
                    "unsupported push url scheme '{}'",
                    other
                )))
            }
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| Error::config(format!("cannot map push url '{}' to {}", raw, scheme)))?;
        }
        Ok(url)
    }

    /// Check that configured URLs parse
    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.management_endpoint).map_err(|e| {
            Error::config(format!(
                "invalid management endpoint '{}': {}",
                self.management_endpoint, e
            ))
        })?;
        self.push_url("validate")?;
        Url::parse(&self.stats.report_url).map_err(|e| {
            Error::config(format!(
                "invalid stats report url '{}': {}",
                self.stats.report_url, e
            ))
        })?;
        Ok(())
    }
}

/// Settings of the relay process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Listen address
    pub bind_host: String,
    /// Listen port
    pub port: u16,
    /// Period of the idle-client sweep
    pub liveness_interval: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_RELAY_PORT,
            liveness_interval: Duration::from_secs(15),
        }
    }
}
