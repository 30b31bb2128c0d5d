//! Startup sequence of the management channel
//!
//! Bootstrap makes sure the management database exists, resolves the
//! instance identity and token, replays the cached overlay, and then hands
//! over to the configured transport. Any failure restarts the whole sequence
//! after the retry delay.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_common::retry::{retry_with_delay, RetryConfig};
use tether_common::settings::{ManagementMode, ManagementSettings};
use tether_common::{
    ConfigOverlay, Error, LiveConfig, Result, SharedStore, StoreError, INSTANCE_ID_KEY,
    MANAGEMENT_DATABASE,
};

use crate::api::SharedControlApi;
use crate::credentials::CredentialManager;
use crate::poll::PollClient;
use crate::push::PushClient;
use crate::reconciler::Reconciler;
use crate::stats::SharedStatsSource;

/// Result of a successful bootstrap
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    /// Persistent instance identifier
    pub instance_id: String,
    /// Control-service token
    pub token: String,
    /// Overlay loaded from the store and applied at startup
    pub loaded_overlay: ConfigOverlay,
}

/// Owns the management channel of one gateway instance
pub struct ManagementAgent {
    store: SharedStore,
    settings: ManagementSettings,
    api: SharedControlApi,
    stats: SharedStatsSource,
    credentials: CredentialManager,
    reconciler: Arc<Reconciler>,
}

impl ManagementAgent {
    /// Create an agent with a fresh live configuration
    pub fn new(
        store: SharedStore,
        settings: ManagementSettings,
        api: SharedControlApi,
        stats: SharedStatsSource,
    ) -> Self {
        let live = Arc::new(LiveConfig::default());
        Self {
            credentials: CredentialManager::new(store.clone(), api.clone()),
            reconciler: Arc::new(Reconciler::new(store.clone(), live)),
            store,
            settings,
            api,
            stats,
        }
    }

    /// Reconciler writing this agent's live configuration
    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Live configuration read by the gateway
    pub fn live(&self) -> &Arc<LiveConfig> {
        self.reconciler.live()
    }

    /// Selected transport
    pub fn mode(&self) -> ManagementMode {
        self.settings.mode
    }

    /// Run the startup sequence once
    pub async fn bootstrap_once(&self) -> Result<BootstrapOutcome> {
        self.ensure_management_database().await?;
        let instance_id = self.instance_id().await?;
        let token = self.credentials.ensure_token(&instance_id).await?;

        let loaded_overlay = self.reconciler.load_cached().await?;
        self.reconciler.patch(&loaded_overlay).await?;

        info!(
            instance_id = %instance_id,
            mode = %self.settings.mode,
            configuration_version = ?loaded_overlay.version,
            "Management bootstrap complete"
        );
        Ok(BootstrapOutcome {
            instance_id,
            token,
            loaded_overlay,
        })
    }

    /// Run the startup sequence until it succeeds; `None` on shutdown
    pub async fn bootstrap(&self, shutdown: &CancellationToken) -> Option<BootstrapOutcome> {
        let retry = RetryConfig::fixed(self.settings.bootstrap_retry_delay);
        tokio::select! {
            _ = shutdown.cancelled() => None,
            outcome = retry_with_delay(&retry, "management bootstrap", || self.bootstrap_once()) => outcome.ok(),
        }
    }

    /// Run the configured transport until `shutdown` fires
    pub async fn run_transport(&self, outcome: &BootstrapOutcome, shutdown: CancellationToken) {
        match self.settings.mode {
            ManagementMode::Push => {
                PushClient::new(
                    outcome.instance_id.clone(),
                    outcome.token.clone(),
                    self.settings.clone(),
                    self.reconciler.clone(),
                    self.stats.clone(),
                    self.store.clone(),
                )
                .run(shutdown)
                .await
            }
            ManagementMode::Poll => {
                PollClient::new(
                    outcome.instance_id.clone(),
                    outcome.token.clone(),
                    self.settings.clone(),
                    self.reconciler.clone(),
                    self.api.clone(),
                    self.stats.clone(),
                    self.store.clone(),
                )
                .run(shutdown)
                .await
            }
            ManagementMode::Disabled => {
                info!("Remote management disabled, no transport started");
                shutdown.cancelled().await;
            }
        }
    }

    /// Bootstrap, then run the transport until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) {
        if let Some(outcome) = self.bootstrap(&shutdown).await {
            self.run_transport(&outcome, shutdown).await;
        }
    }

    async fn ensure_management_database(&self) -> Result<()> {
        match self.store.create_bucket(MANAGEMENT_DATABASE).await {
            Ok(()) => {
                info!(bucket = MANAGEMENT_DATABASE, "Created management database");
                Ok(())
            }
            Err(StoreError::BucketAlreadyExists { .. }) => {
                debug!(bucket = MANAGEMENT_DATABASE, "Management database already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn instance_id(&self) -> Result<String> {
        match self.store.get(MANAGEMENT_DATABASE, INSTANCE_ID_KEY).await {
            Ok(Value::String(id)) if !id.is_empty() => return Ok(id),
            Ok(other) => {
                return Err(Error::config(format!("invalid stored instance id: {}", other)));
            }
            Err(StoreError::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let id = uuid::Uuid::new_v4().to_string();
        warn!(instance_id = %id, "No instance id found, generated a new one");
        self.store
            .put(MANAGEMENT_DATABASE, INSTANCE_ID_KEY, Value::String(id.clone()))
            .await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use tether_common::protocol::RegisterResponse;
    use tether_common::store::{put_json, MemoryStore};
    use tether_common::{MetadataStore, CREDENTIALS_KEY};

    use crate::api::MockControlApi;
    use crate::credentials::tests::test_credentials;
    use crate::stats::MockStatsSource;

    fn agent(store: Arc<MemoryStore>, api: MockControlApi, mode: ManagementMode) -> ManagementAgent {
        let settings = ManagementSettings {
            mode,
            ..Default::default()
        };
        ManagementAgent::new(store, settings, Arc::new(api), Arc::new(MockStatsSource::new()))
    }

    fn registered() -> RegisterResponse {
        serde_json::from_value(json!({"token": "fresh-token", "serial": 1})).unwrap()
    }

    /// Story: a brand new instance creates its database, invents an
    /// identity, registers once and remembers everything for the next boot
    #[tokio::test]
    async fn story_first_boot() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockControlApi::new();
        api.expect_register().times(1).returning(|_, _| Ok(registered()));
        api.expect_confirm().times(1).returning(|_, _, _| Ok(()));
        let agent = agent(store.clone(), api, ManagementMode::Push);

        let outcome = agent.bootstrap_once().await.unwrap();
        assert_eq!(outcome.token, "fresh-token");
        assert_eq!(outcome.loaded_overlay, ConfigOverlay::empty());
        assert_eq!(agent.live().overlay_version(), None);

        let stored_id = store.get(MANAGEMENT_DATABASE, INSTANCE_ID_KEY).await.unwrap();
        assert_eq!(stored_id, json!(outcome.instance_id));
        assert!(store.get(MANAGEMENT_DATABASE, CREDENTIALS_KEY).await.is_ok());
    }

    #[tokio::test]
    async fn test_restart_reuses_identity_and_replays_cache() {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket(MANAGEMENT_DATABASE).await.unwrap();
        store
            .put(MANAGEMENT_DATABASE, INSTANCE_ID_KEY, json!("fixed-id"))
            .await
            .unwrap();
        put_json(store.as_ref(), MANAGEMENT_DATABASE, CREDENTIALS_KEY, &test_credentials())
            .await
            .unwrap();

        // no API calls expected
        let agent = agent(store.clone(), MockControlApi::new(), ManagementMode::Poll);
        let cached: ConfigOverlay = serde_json::from_value(json!({"version": 3})).unwrap();
        agent.reconciler().save(None, &cached).await.unwrap();

        let outcome = agent.bootstrap_once().await.unwrap();
        assert_eq!(outcome.instance_id, "fixed-id");
        assert_eq!(outcome.token, "token-1");
        assert_eq!(outcome.loaded_overlay, cached);
        assert_eq!(agent.live().overlay_version(), Some(3));
    }

    #[tokio::test]
    async fn test_invalid_instance_id_fails_bootstrap() {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket(MANAGEMENT_DATABASE).await.unwrap();
        store
            .put(MANAGEMENT_DATABASE, INSTANCE_ID_KEY, json!(12))
            .await
            .unwrap();
        let agent = agent(store, MockControlApi::new(), ManagementMode::Push);
        assert!(matches!(agent.bootstrap_once().await, Err(Error::Config { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrap_retries_after_delay() {
        let store = Arc::new(MemoryStore::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let mut api = MockControlApi::new();
        {
            let attempts = attempts.clone();
            api.expect_register().times(2).returning(move |_, _| {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::http_status("register", 503, "unavailable"))
                } else {
                    Ok(registered())
                }
            });
        }
        api.expect_confirm().times(1).returning(|_, _, _| Ok(()));
        let agent = agent(store, api, ManagementMode::Push);

        let started = tokio::time::Instant::now();
        let outcome = agent.bootstrap(&CancellationToken::new()).await.unwrap();
        assert_eq!(outcome.token, "fresh-token");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_bootstrap_stops_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let mut api = MockControlApi::new();
        api.expect_register()
            .returning(|_, _| Err(Error::http_status("register", 503, "unavailable")));
        let agent = agent(store, api, ManagementMode::Push);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert!(agent.bootstrap(&shutdown).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_mode_runs_no_transport() {
        let store = Arc::new(MemoryStore::new());
        store.create_bucket(MANAGEMENT_DATABASE).await.unwrap();
        put_json(store.as_ref(), MANAGEMENT_DATABASE, CREDENTIALS_KEY, &test_credentials())
            .await
            .unwrap();
        let agent = agent(store, MockControlApi::new(), ManagementMode::Disabled);

        let outcome = agent.bootstrap_once().await.unwrap();
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), agent.run_transport(&outcome, shutdown))
            .await
            .unwrap();
    }
}
