//! OAuth credentials and their persisted copy.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{self, StateStore, StoreResult};

const NAMESPACE: &str = "credentials";

/// Access/refresh token pair.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Expiry in unix seconds, when the issuer reported one.
    #[serde(default)]
    pub expires_at: Option<f64>,
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            expires_at: None,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"***")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "***"))
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-tenant credential storage shared across processes.
#[derive(Clone)]
pub struct CredentialStore {
    store: Arc<dyn StateStore>,
}

impl CredentialStore {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, tenant: &str) -> StoreResult<Option<Credential>> {
        store::get_as(self.store.as_ref(), NAMESPACE, tenant)
    }

    pub fn save(&self, tenant: &str, credential: &Credential) -> StoreResult<()> {
        store::mutate_as::<Credential, ()>(self.store.as_ref(), NAMESPACE, tenant, |slot| {
            *slot = Some(credential.clone());
        })
    }

    /// Store `credential` only when nothing is stored yet.
    pub fn seed(&self, tenant: &str, credential: &Credential) -> StoreResult<()> {
        store::mutate_as::<Credential, ()>(self.store.as_ref(), NAMESPACE, tenant, |slot| {
            if slot.is_none() {
                *slot = Some(credential.clone());
            }
        })
    }
}
