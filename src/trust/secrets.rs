//! In-memory secret storage for the daemon.
//!
//! Holds the secrets most recently pushed by an authorized client. Never
//! persisted; values are zeroized when replaced or when the store drops.

use super::content::SecretPayload;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Current provisioning status of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    /// Nothing pushed yet
    WaitingForProvisioning,
    /// Secrets available for sync
    Provisioned,
}

/// In-memory secret store.
pub struct SecretStore {
    secrets: RwLock<Option<SecretPayload>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            secrets: RwLock::new(None),
        }
    }

    pub async fn is_provisioned(&self) -> bool {
        self.secrets.read().await.is_some()
    }

    pub async fn status(&self) -> ProvisioningStatus {
        if self.is_provisioned().await {
            ProvisioningStatus::Provisioned
        } else {
            ProvisioningStatus::WaitingForProvisioning
        }
    }

    /// Replace the stored secrets. The previous set is dropped (and wiped).
    ///
    /// Returns the number of variables now stored.
    pub async fn provision(&self, secrets: SecretPayload) -> usize {
        let count = secrets.len();
        let previous = self.secrets.write().await.replace(secrets);
        drop(previous);
        count
    }

    /// Copy of the current secrets, if any.
    pub async fn snapshot(&self) -> Option<SecretPayload> {
        self.secrets.read().await.clone()
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretStore").finish_non_exhaustive()
    }
}

/// Shared secret store handle.
pub type SharedSecretStore = Arc<SecretStore>;

pub fn create_secret_store() -> SharedSecretStore {
    Arc::new(SecretStore::new())
}
