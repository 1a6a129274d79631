//! Identity registry (trust store) and role ordering.

use super::crypto::{self, CryptoResult};
use envtrust_types::{Role, TrustStoreRecord};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::{info, Span};
use x25519_dalek::PublicKey;

/// Registry mutation errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Fingerprint already registered: {0}")]
    DuplicateFingerprint(String),

    #[error("Key id already registered: {0}")]
    DuplicateKeyId(String),

    #[error("Invalid trust-store record {fingerprint}: {reason}")]
    InvalidRecord {
        fingerprint: String,
        reason: &'static str,
    },
}

/// `true` if `actual` grants at least the access of `required`.
///
/// Unrecognized roles on either side deny.
pub fn role_at_least(actual: Role, required: Role) -> bool {
    match (actual.rank(), required.rank()) {
        (Some(a), Some(r)) => a >= r,
        _ => false,
    }
}

/// A registered principal.
///
/// Keys are kept in their base64 wire form and decoded at the point of use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub fingerprint: String,
    pub role: Role,
    /// Ed25519 verification key (base64)
    pub sign_public: String,
    pub key_id: String,
    /// X25519 key-agreement key (base64), empty when not registered
    pub public_key: String,
}

impl Identity {
    pub fn new(fingerprint: impl Into<String>, role: Role, sign_public: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            role,
            sign_public: sign_public.into(),
            key_id: String::new(),
            public_key: String::new(),
        }
    }

    pub fn with_key_id(mut self, key_id: impl Into<String>) -> Self {
        self.key_id = key_id.into();
        self
    }

    pub fn with_public_key(mut self, public_key: impl Into<String>) -> Self {
        self.public_key = public_key.into();
        self
    }

    pub fn verifying_key(&self) -> CryptoResult<ed25519_dalek::VerifyingKey> {
        crypto::parse_ed25519_public_key(&self.sign_public)
    }

    /// Registered key-agreement key, if any.
    pub fn agreement_key(&self) -> Option<CryptoResult<PublicKey>> {
        if self.public_key.is_empty() {
            None
        } else {
            Some(crypto::parse_x25519_public_key(&self.public_key))
        }
    }
}

impl TryFrom<TrustStoreRecord> for Identity {
    type Error = RegistryError;

    fn try_from(record: TrustStoreRecord) -> Result<Self, Self::Error> {
        let invalid = |reason| RegistryError::InvalidRecord {
            fingerprint: record.fingerprint.clone(),
            reason,
        };
        if record.fingerprint.is_empty() {
            return Err(invalid("empty fingerprint"));
        }
        if crypto::parse_ed25519_public_key(&record.sign_public).is_err() {
            return Err(invalid("sign_public is not a base64 Ed25519 key"));
        }
        if !record.public_key.is_empty()
            && crypto::parse_x25519_public_key(&record.public_key).is_err()
        {
            return Err(invalid("public_key is not a base64 X25519 key"));
        }

        Ok(Identity {
            fingerprint: record.fingerprint,
            role: record.role,
            sign_public: record.sign_public,
            key_id: record.key_id,
            public_key: record.public_key,
        })
    }
}

#[derive(Debug, Default)]
struct Index {
    by_fingerprint: HashMap<String, Identity>,
    fingerprint_by_key_id: HashMap<String, String>,
}

/// Fingerprint-indexed set of identities.
///
/// Lookups share a read lock; [`IdentityRegistry::add`] and
/// [`IdentityRegistry::remove`] take the write lock. Nothing else mutates.
#[derive(Debug)]
pub struct IdentityRegistry {
    index: RwLock<Index>,
    span: Span,
}

impl IdentityRegistry {
    pub fn new(span: Span) -> Self {
        Self {
            index: RwLock::new(Index::default()),
            span,
        }
    }

    /// Build a registry from trust-store records. Fails on the first bad
    /// or duplicate record.
    pub fn from_records(
        records: impl IntoIterator<Item = TrustStoreRecord>,
        span: Span,
    ) -> Result<Self, RegistryError> {
        let registry = Self::new(span);
        for record in records {
            registry.add(Identity::try_from(record)?)?;
        }
        Ok(registry)
    }

    pub fn lookup(&self, fingerprint: &str) -> Option<Identity> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index.by_fingerprint.get(fingerprint).cloned()
    }

    pub fn lookup_by_key_id(&self, key_id: &str) -> Option<Identity> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        index
            .fingerprint_by_key_id
            .get(key_id)
            .and_then(|fp| index.by_fingerprint.get(fp))
            .cloned()
    }

    /// Register an identity. Duplicates leave the registry unchanged.
    pub fn add(&self, identity: Identity) -> Result<(), RegistryError> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        if index.by_fingerprint.contains_key(&identity.fingerprint) {
            return Err(RegistryError::DuplicateFingerprint(identity.fingerprint));
        }
        if !identity.key_id.is_empty() && index.fingerprint_by_key_id.contains_key(&identity.key_id)
        {
            return Err(RegistryError::DuplicateKeyId(identity.key_id));
        }

        let _enter = self.span.enter();
        info!(fingerprint = %identity.fingerprint, role = %identity.role, "Identity registered");
        if !identity.key_id.is_empty() {
            index
                .fingerprint_by_key_id
                .insert(identity.key_id.clone(), identity.fingerprint.clone());
        }
        index
            .by_fingerprint
            .insert(identity.fingerprint.clone(), identity);
        Ok(())
    }

    /// Remove an identity, returning it if it was registered.
    pub fn remove(&self, fingerprint: &str) -> Option<Identity> {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        let removed = index.by_fingerprint.remove(fingerprint)?;
        if !removed.key_id.is_empty() {
            index.fingerprint_by_key_id.remove(&removed.key_id);
        }
        let _enter = self.span.enter();
        info!(%fingerprint, "Identity removed");
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_fingerprint
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new(tracing::info_span!("identity_registry"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::keys::KeyPairManager;
    use std::sync::Arc;
    use std::thread;

    const ROLES: [Role; 4] = [Role::Reader, Role::Deployer, Role::Admin, Role::Owner];

    #[test]
    fn role_order_is_total_and_fixed() {
        for (i, actual) in ROLES.iter().enumerate() {
            for (j, required) in ROLES.iter().enumerate() {
                assert_eq!(role_at_least(*actual, *required), i >= j, "{actual} vs {required}");
            }
        }
    }

    #[test]
    fn unrecognized_role_denies() {
        for role in ROLES {
            assert!(!role_at_least(Role::Unrecognized, role));
            assert!(!role_at_least(role, Role::Unrecognized));
        }
        assert!(!role_at_least(Role::Unrecognized, Role::Unrecognized));
    }

    fn record(role: Role) -> TrustStoreRecord {
        KeyPairManager::default().generate().unwrap().trust_record(role)
    }

    #[test]
    fn lookup_by_fingerprint_and_key_id() {
        let rec = record(Role::Admin);
        let registry = IdentityRegistry::from_records([rec.clone()], Span::none()).unwrap();

        let by_fp = registry.lookup(&rec.fingerprint).unwrap();
        assert_eq!(by_fp.role, Role::Admin);
        let by_kid = registry.lookup_by_key_id(&rec.key_id).unwrap();
        assert_eq!(by_kid, by_fp);
        assert!(registry.lookup("missing").is_none());
        assert!(registry.lookup_by_key_id("missing").is_none());
    }

    #[test]
    fn duplicates_are_rejected_without_mutation() {
        let rec = record(Role::Reader);
        let registry = IdentityRegistry::from_records([rec.clone()], Span::none()).unwrap();

        let mut same_fp = record(Role::Owner);
        same_fp.fingerprint = rec.fingerprint.clone();
        let err = registry.add(Identity::try_from(same_fp).unwrap()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateFingerprint(_)));

        let mut same_kid = record(Role::Owner);
        same_kid.key_id = rec.key_id.clone();
        let err = registry.add(Identity::try_from(same_kid).unwrap()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKeyId(_)));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(&rec.fingerprint).unwrap().role, Role::Reader);
    }

    #[test]
    fn remove_clears_both_indexes() {
        let rec = record(Role::Deployer);
        let registry = IdentityRegistry::from_records([rec.clone()], Span::none()).unwrap();
        assert!(registry.remove(&rec.fingerprint).is_some());
        assert!(registry.remove(&rec.fingerprint).is_none());
        assert!(registry.lookup_by_key_id(&rec.key_id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn invalid_records_are_rejected() {
        let mut rec = record(Role::Reader);
        rec.sign_public = "AAAA".to_string();
        assert!(matches!(
            IdentityRegistry::from_records([rec], Span::none()),
            Err(RegistryError::InvalidRecord { .. })
        ));

        let mut rec = record(Role::Reader);
        rec.fingerprint.clear();
        assert!(Identity::try_from(rec).is_err());
    }

    #[test]
    fn concurrent_readers_with_a_writer() {
        let registry = Arc::new(IdentityRegistry::new(Span::none()));
        let records: Vec<_> = (0..16).map(|_| record(Role::Reader)).collect();

        let writer = {
            let registry = Arc::clone(&registry);
            let records = records.clone();
            thread::spawn(move || {
                for rec in records {
                    registry.add(Identity::try_from(rec).unwrap()).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let records = records.clone();
                thread::spawn(move || {
                    for rec in &records {
                        if let Some(identity) = registry.lookup(&rec.fingerprint) {
                            assert_eq!(identity.key_id, rec.key_id);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(registry.len(), 16);
    }
}
