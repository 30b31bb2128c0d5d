//! Overlay reconciliation
//!
//! The reconciler is the only writer of the live [`RuntimeConfig`]. It
//! applies overlays in strictly increasing version order, persists accepted
//! versions in the management database, and announces every applied overlay
//! on a broadcast feed.
//!
//! Applying and persisting are separate steps. An overlay is applied first
//! and saved afterwards; if the save fails the live configuration keeps the
//! new version while the store still points at the previous one, and the next
//! boot replays from the older cached version until the control service
//! resends the newer one.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info};

use tether_common::runtime::{
    AuthAccount, LiveConfig, RuntimeConfig, REPLICATOR_DEFAULT_LOCATION, REPLICATOR_ENDPOINT,
};
use tether_common::store::get_json;
use tether_common::{
    overlay_key, ConfigOverlay, Error, Result, SharedStore, MANAGEMENT_DATABASE,
    OVERLAY_VERSION_KEY,
};

use crate::credentials::{stored_credentials, SecretDecryptor};
use crate::locations::{patch_locations, replication_endpoints};

/// Capacity of the applied-overlay feed
const APPLIED_FEED_CAPACITY: usize = 16;

/// Result of [`Reconciler::patch`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The overlay was applied and is now live
    Applied {
        /// Version now live
        version: u64,
    },
    /// The overlay has no version yet; nothing to apply
    Unversioned,
    /// A version at least as new is already live
    AlreadyApplied {
        /// Version of the rejected overlay
        version: u64,
        /// Version currently live
        current: u64,
    },
}

/// Applies overlays to the live configuration and persists them
pub struct Reconciler {
    store: SharedStore,
    live: Arc<LiveConfig>,
    patch_lock: Mutex<()>,
    applied: broadcast::Sender<ConfigOverlay>,
}

impl Reconciler {
    /// Create a reconciler writing `live` and persisting into `store`
    pub fn new(store: SharedStore, live: Arc<LiveConfig>) -> Self {
        let (applied, _) = broadcast::channel(APPLIED_FEED_CAPACITY);
        Self {
            store,
            live,
            patch_lock: Mutex::new(()),
            applied,
        }
    }

    /// Live configuration owned by this reconciler
    pub fn live(&self) -> &Arc<LiveConfig> {
        &self.live
    }

    /// Subscribe to overlays as they are applied
    pub fn subscribe_applied(&self) -> broadcast::Receiver<ConfigOverlay> {
        self.applied.subscribe()
    }

    /// Apply `overlay` to the live configuration.
    ///
    /// Overlays without a version, or not newer than the live version, are
    /// no-ops. On error nothing is published and the live version is left
    /// unchanged.
    pub async fn patch(&self, overlay: &ConfigOverlay) -> Result<PatchOutcome> {
        let _guard = self.patch_lock.lock().await;

        let Some(version) = overlay.version else {
            debug!("No remote configuration created yet");
            return Ok(PatchOutcome::Unversioned);
        };

        let current = self.live.snapshot();
        if let Some(live_version) = current.overlay_version {
            if version <= live_version {
                debug!(
                    configuration_version = version,
                    live_version, "Configuration version already applied"
                );
                return Ok(PatchOutcome::AlreadyApplied {
                    version,
                    current: live_version,
                });
            }
        }

        let credentials = stored_credentials(self.store.as_ref()).await?;
        let decryptor = credentials.decryptor()?;

        let accounts = build_accounts(overlay, &decryptor, version)?;

        let mut rest_endpoints = current.rest_endpoints.clone();
        for endpoint in &overlay.endpoints {
            rest_endpoints.insert(endpoint.hostname.clone(), endpoint.location_name.clone());
        }
        rest_endpoints
            .entry(REPLICATOR_ENDPOINT.to_string())
            .or_insert_with(|| REPLICATOR_DEFAULT_LOCATION.to_string());

        let locations = patch_locations(&overlay.locations, &decryptor).map_err(|e| {
            error!(
                configuration_version = version,
                error = %e,
                "Could not apply configuration version location constraints"
            );
            e
        })?;
        // an overlay without usable locations leaves the current ones in place
        let (location_constraints, replication) = if locations.is_empty() {
            (
                current.location_constraints.clone(),
                current.replication_endpoints.clone(),
            )
        } else {
            let replication = replication_endpoints(&locations);
            (locations, replication)
        };

        let browser_access_enabled = overlay
            .browser_access_enabled()
            .unwrap_or(current.browser_access_enabled);

        self.live.replace(RuntimeConfig {
            overlay_version: Some(version),
            accounts,
            rest_endpoints,
            location_constraints,
            replication_endpoints: replication,
            public_instance_id: overlay.instance_id.clone(),
            browser_access_enabled,
        });

        info!(configuration_version = version, "Applied configuration version");
        // no relay attached is fine
        let _ = self.applied.send(overlay.clone());

        Ok(PatchOutcome::Applied { version })
    }

    /// Persist `remote` if it is newer than `cached`.
    ///
    /// Writes the versioned document first, then moves the version pointer.
    /// Returns whether anything was written.
    pub async fn save(&self, cached: Option<&ConfigOverlay>, remote: &ConfigOverlay) -> Result<bool> {
        let Some(version) = remote.version.filter(|_| remote.is_newer_than(cached)) else {
            debug!("No remote configuration to cache yet");
            return Ok(false);
        };

        let document = serde_json::to_value(remote)?;
        self.store
            .put(MANAGEMENT_DATABASE, &overlay_key(version), document)
            .await
            .map_err(|e| {
                error!(configuration_version = version, error = %e, "Could not save configuration");
                Error::from(e)
            })?;

        self.store
            .put(MANAGEMENT_DATABASE, OVERLAY_VERSION_KEY, Value::from(version))
            .await
            .map_err(|e| {
                error!(
                    configuration_version = version,
                    error = %e,
                    "Could not save configuration version"
                );
                Error::from(e)
            })?;

        Ok(true)
    }

    /// Load the latest persisted overlay, `{}` when there is none
    pub async fn load_cached(&self) -> Result<ConfigOverlay> {
        let pointer = match self.store.get(MANAGEMENT_DATABASE, OVERLAY_VERSION_KEY).await {
            Ok(value) => value,
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    return Ok(ConfigOverlay::empty());
                }
                return Err(e);
            }
        };

        let version = parse_version_pointer(&pointer).ok_or_else(|| {
            Error::overlay(None, format!("invalid overlay version pointer: {}", pointer))
        })?;

        match get_json::<ConfigOverlay>(self.store.as_ref(), MANAGEMENT_DATABASE, &overlay_key(version)).await {
            Ok(overlay) => Ok(overlay),
            Err(e) => {
                let e = Error::from(e);
                if e.is_not_found() {
                    debug!(configuration_version = version, "Cached overlay document missing");
                    return Ok(ConfigOverlay::empty());
                }
                Err(e)
            }
        }
    }

    /// Apply a pushed overlay, then persist it. Errors are logged.
    pub async fn apply_and_save(&self, overlay: &ConfigOverlay) {
        if let Err(e) = self.patch(overlay).await {
            error!(error = %e, "Could not apply pushed overlay");
            return;
        }
        match self.save(None, overlay).await {
            Ok(_) => info!("Overlay push processed"),
            Err(e) => error!(error = %e, "Could not cache overlay version"),
        }
    }
}

fn parse_version_pointer(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn build_accounts(
    overlay: &ConfigOverlay,
    decryptor: &SecretDecryptor,
    version: u64,
) -> Result<Vec<AuthAccount>> {
    let mut accounts = Vec::new();
    for user in &overlay.users {
        let Some(ciphertext) = user.encrypted_secret() else {
            continue;
        };
        let access_key = user.access_key.as_deref().unwrap_or_default();
        let secret = decryptor.decrypt(ciphertext).map_err(|e| {
            Error::overlay(
                Some(version),
                format!("could not decrypt secret of user {}: {}", access_key, e),
            )
        })?;
        accounts.push(AuthAccount::new(
            access_key,
            &secret,
            user.canonical_id.as_deref(),
            user.service_name(),
            user.user_name.as_deref(),
        ));
    }
    Ok(accounts)
}
