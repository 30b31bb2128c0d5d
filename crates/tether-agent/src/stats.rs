//! Local stats report source
//!
//! The gateway exposes its usage report at `/_/report`, guarded by a report
//! token. Both transports forward that body verbatim to the control service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use tether_common::settings::StatsSettings;
use tether_common::{Error, Result, REPORT_SKIP_CACHE_HEADER, REPORT_TOKEN_HEADER};

/// Source of stats reports
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatsSource: Send + Sync {
    /// Fetch a report body; `skip_cache` asks for freshly computed numbers
    async fn fetch(&self, skip_cache: bool) -> Result<Vec<u8>>;
}

/// Shared stats source handle
pub type SharedStatsSource = Arc<dyn StatsSource>;

/// [`StatsSource`] reading the gateway's local report endpoint
pub struct HttpStatsSource {
    client: reqwest::Client,
    settings: StatsSettings,
}

impl HttpStatsSource {
    /// Create a source for the given settings
    pub fn new(settings: StatsSettings, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::http("stats", format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, settings })
    }
}

#[async_trait]
impl StatsSource for HttpStatsSource {
    async fn fetch(&self, skip_cache: bool) -> Result<Vec<u8>> {
        let mut request = self
            .client
            .get(&self.settings.report_url)
            .header(REPORT_TOKEN_HEADER, &self.settings.report_token);
        if skip_cache {
            request = request.header(REPORT_SKIP_CACHE_HEADER, "true");
        }

        let response = request.send().await.map_err(|e| {
            Error::http(
                "report",
                format!("failed to get metrics report at {}: {}", self.settings.report_url, e),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::http_status(
                "report",
                status.as_u16(),
                format!("metrics report at {} failed", self.settings.report_url),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::http("report", e.to_string()))?;
        debug!(bytes = body.len(), skip_cache, "Fetched metrics report");
        Ok(body.to_vec())
    }
}
