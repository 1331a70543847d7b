//! Single-flight credential refresh.
//!
//! Within a process a per-tenant async mutex admits one refresher; across
//! processes a lease record in the state store does the same. Everyone else
//! waits for the holder and then reloads the stored credential.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::api::types::ApiError;
use crate::auth::credentials::{Credential, CredentialStore};
use crate::clock::Clock;
use crate::error::{GuardError, GuardResult};
use crate::store::{self, StateStore};

const LEASE_NAMESPACE: &str = "refresh_leases";
const LEASE_POLL: Duration = Duration::from_millis(100);

/// Exchanges a refresh token for a new credential.
#[async_trait]
pub trait Refresher: Send + Sync {
    async fn refresh(&self, tenant: &str, current: &Credential) -> Result<Credential, ApiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Lease {
    holder: String,
    expires_at: f64,
}

enum LeaseOutcome {
    Acquired,
    RefreshedElsewhere(Credential),
}

/// Coordinates refreshes so only one runs per tenant at a time.
pub struct RefreshCoordinator {
    credentials: CredentialStore,
    store: Arc<dyn StateStore>,
    refresher: Arc<dyn Refresher>,
    clock: Arc<dyn Clock>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    holder: String,
    lease_ttl: Duration,
    wait: Duration,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        refresher: Arc<dyn Refresher>,
        clock: Arc<dyn Clock>,
        wait: Duration,
    ) -> Self {
        Self {
            credentials: CredentialStore::new(store.clone()),
            store,
            refresher,
            clock,
            locks: DashMap::new(),
            holder: uuid::Uuid::new_v4().to_string(),
            lease_ttl: Duration::from_secs(30),
            wait,
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// The credential currently stored for `tenant`.
    pub fn current(&self, tenant: &str) -> GuardResult<Option<Credential>> {
        Ok(self.credentials.load(tenant)?)
    }

    /// Make sure the stored credential is newer than `stale`.
    ///
    /// Returns the fresh credential, refreshing it only if no other caller
    /// already did.
    pub async fn refresh_if_needed(
        &self,
        tenant: &str,
        stale: Option<&Credential>,
    ) -> GuardResult<Credential> {
        let lock = self
            .locks
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        if let Ok(_guard) = lock.try_lock() {
            return self.refresh_locked(tenant, stale).await;
        }

        tracing::debug!(tenant, "Refresh in flight, waiting for holder");
        if tokio::time::timeout(self.wait, lock.lock()).await.is_err() {
            return Err(refresh_error(tenant, "timed out waiting for concurrent refresh"));
        }

        match self.credentials.load(tenant)? {
            Some(current) if Some(&current) != stale => Ok(current),
            _ => Err(refresh_error(
                tenant,
                "concurrent refresh did not produce a new credential",
            )),
        }
    }

    async fn refresh_locked(
        &self,
        tenant: &str,
        stale: Option<&Credential>,
    ) -> GuardResult<Credential> {
        let stored = self.credentials.load(tenant)?;
        if let Some(current) = &stored {
            if stale.is_some_and(|s| s != current) {
                tracing::debug!(tenant, "Credential already refreshed");
                return Ok(current.clone());
            }
        }
        let Some(base) = stored.or_else(|| stale.cloned()) else {
            return Err(refresh_error(tenant, "no credential to refresh"));
        };

        if let LeaseOutcome::RefreshedElsewhere(fresh) = self.acquire_lease(tenant, &base).await? {
            return Ok(fresh);
        }

        let outcome = match self.refresher.refresh(tenant, &base).await {
            Ok(fresh) => self
                .credentials
                .save(tenant, &fresh)
                .map(|()| fresh)
                .map_err(GuardError::from),
            Err(e) => Err(refresh_error(tenant, &e.to_string())),
        };
        self.release_lease(tenant);

        match &outcome {
            Ok(_) => tracing::info!(tenant, "Credential refreshed"),
            Err(e) => tracing::warn!(tenant, error = %e, "Credential refresh failed"),
        }
        outcome
    }

    async fn acquire_lease(&self, tenant: &str, base: &Credential) -> GuardResult<LeaseOutcome> {
        let deadline = self.clock.now() + self.wait.as_secs_f64();
        loop {
            let now = self.clock.now();
            let holder = self.holder.clone();
            let expires_at = now + self.lease_ttl.as_secs_f64();
            let acquired = store::mutate_as::<Lease, bool>(
                self.store.as_ref(),
                LEASE_NAMESPACE,
                tenant,
                |slot| {
                    let held_elsewhere = slot
                        .as_ref()
                        .is_some_and(|lease| lease.holder != holder && lease.expires_at > now);
                    if held_elsewhere {
                        return false;
                    }
                    *slot = Some(Lease { holder, expires_at });
                    true
                },
            )?;
            if acquired {
                return Ok(LeaseOutcome::Acquired);
            }

            if let Some(current) = self.credentials.load(tenant)? {
                if &current != base {
                    return Ok(LeaseOutcome::RefreshedElsewhere(current));
                }
            }
            if now >= deadline {
                return Err(refresh_error(tenant, "refresh lease held by another process"));
            }
            self.clock.sleep(LEASE_POLL).await;
        }
    }

    fn release_lease(&self, tenant: &str) {
        let holder = &self.holder;
        let released = store::mutate_as::<Lease, ()>(
            self.store.as_ref(),
            LEASE_NAMESPACE,
            tenant,
            |slot| {
                if slot.as_ref().is_some_and(|lease| &lease.holder == holder) {
                    *slot = None;
                }
            },
        );
        if let Err(e) = released {
            tracing::warn!(tenant, error = %e, "Failed to release refresh lease");
        }
    }
}

fn refresh_error(tenant: &str, reason: &str) -> GuardError {
    GuardError::Refresh {
        tenant: tenant.to_string(),
        reason: reason.to_string(),
    }
}
