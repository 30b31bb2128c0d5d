//! Poll transport
//!
//! Fallback for deployments that cannot hold a WebSocket open. Two
//! independent loops run until shutdown: one fetches the remote overlay and
//! reconciles it, the other posts the local stats report. Neither stops on
//! errors. There is no tunneling in this mode.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tether_common::settings::ManagementSettings;
use tether_common::{ConfigOverlay, Result, SharedStore, MANAGEMENT_DATABASE};

use crate::api::SharedControlApi;
use crate::reconciler::Reconciler;
use crate::stats::SharedStatsSource;

/// Poll transport for one instance
pub struct PollClient {
    instance_id: String,
    token: String,
    settings: ManagementSettings,
    reconciler: Arc<Reconciler>,
    api: SharedControlApi,
    stats: SharedStatsSource,
    store: SharedStore,
}

impl PollClient {
    /// Create a poll client; call [`PollClient::run`] to start it
    pub fn new(
        instance_id: impl Into<String>,
        token: impl Into<String>,
        settings: ManagementSettings,
        reconciler: Arc<Reconciler>,
        api: SharedControlApi,
        stats: SharedStatsSource,
        store: SharedStore,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            token: token.into(),
            settings,
            reconciler,
            api,
            stats,
            store,
        }
    }

    /// Run both loops until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            overlay_interval_s = self.settings.overlay_poll_interval.as_secs(),
            stats_interval_s = self.settings.stats_push_interval.as_secs(),
            "Starting polling management client"
        );
        tokio::join!(
            self.run_overlay_loop(shutdown.clone()),
            self.run_stats_loop(shutdown)
        );
    }

    async fn run_overlay_loop(&self, shutdown: CancellationToken) {
        let mut cached = match self.reconciler.load_cached().await {
            Ok(overlay) => overlay,
            Err(e) => {
                error!(error = %e, "Could not load cached overlay");
                ConfigOverlay::empty()
            }
        };

        let mut ticker = interval(self.settings.overlay_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_overlay(&mut cached).await {
                        error!(error = %e, "Could not apply managed configuration");
                    }
                }
            }
        }
    }

    /// Fetch the remote overlay once and reconcile it against `cached`.
    ///
    /// The overlay is applied first and only persisted once applied; `cached`
    /// follows what was persisted.
    pub async fn sync_overlay(&self, cached: &mut ConfigOverlay) -> Result<()> {
        debug!("Loading remote overlay");
        let remote = self.api.fetch_overlay(&self.instance_id, &self.token).await?;

        self.reconciler.patch(&remote).await?;
        if self.reconciler.save(Some(&*cached), &remote).await? {
            *cached = remote;
        }
        Ok(())
    }

    async fn run_stats_loop(&self, shutdown: CancellationToken) {
        let mut changes = self.store.subscribe_changes();
        let mut changes_open = true;
        let mut ticker = interval(self.settings.stats_push_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let skip_cache = tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => false,
                change = changes.recv(), if changes_open => match change {
                    Ok(change) if change.bucket == MANAGEMENT_DATABASE => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => true,
                    Err(broadcast::error::RecvError::Closed) => {
                        changes_open = false;
                        continue;
                    }
                },
            };
            if let Err(e) = self.push_stats(skip_cache).await {
                info!(error = %e, "Could not post stats");
            }
        }
    }

    /// Fetch the local report and post it to the control service
    pub async fn push_stats(&self, skip_cache: bool) -> Result<()> {
        let body = self.stats.fetch(skip_cache).await?;
        self.api.post_stats(&self.instance_id, &self.token, body).await
    }
}
