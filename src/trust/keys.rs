//! Key pair lifecycle: generation, scoped use of private halves, disposal.
//!
//! A [`KeyPair`] bundles an X25519 key-agreement pair, an Ed25519 signing
//! pair and optionally a second Ed25519 pair reserved for session tokens.
//! Private halves never leave this module. Callers get signatures and shared
//! secrets, not key bytes.
//!
//! Private halves sit behind a reader-writer lock: sign and derive hold the
//! read side for the duration of one call, [`KeyPair::dispose`] takes the
//! write side, so zeroing waits for every in-flight borrow to finish.

use super::crypto::{self, CryptoError};
use super::memory::{platform_guard, MemoryGuard, SecretBuffer};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use envtrust_types::{PublicKeyResponse, Role, TrustStoreRecord};
use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::{debug, info, Span};
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
use zeroize::Zeroizing;

/// Key management errors
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Entropy source failure: {0}")]
    Entropy(#[from] rand::Error),

    #[error("Key material has been disposed")]
    Disposed,

    #[error("No token-signing key present")]
    NoTokenKey,

    #[error("Key lock poisoned by a panicked borrower")]
    Poisoned,

    #[error("Key agreement failed: {0}")]
    Agreement(#[from] CryptoError),
}

/// Source of key-generation randomness.
///
/// Failures must surface; implementations never fall back to a weaker
/// generator.
pub trait EntropySource: Send + Sync {
    fn fill(&self, dest: &mut [u8]) -> Result<(), rand::Error>;
}

/// The operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, dest: &mut [u8]) -> Result<(), rand::Error> {
        OsRng.try_fill_bytes(dest)
    }
}

struct PrivateHalves {
    agreement: SecretBuffer<32>,
    signing: SecretBuffer<32>,
    token: Option<SecretBuffer<32>>,
}

/// One principal's keys.
pub struct KeyPair {
    key_id: String,
    fingerprint: String,
    agreement_public: PublicKey,
    signing_public: VerifyingKey,
    token_public: Option<VerifyingKey>,
    private: RwLock<Option<PrivateHalves>>,
    span: Span,
}

impl KeyPair {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Identity fingerprint derived from the signing public key.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn agreement_public(&self) -> &PublicKey {
        &self.agreement_public
    }

    pub fn signing_public(&self) -> &VerifyingKey {
        &self.signing_public
    }

    pub fn token_public(&self) -> Option<&VerifyingKey> {
        self.token_public.as_ref()
    }

    /// Public-key discovery document for this pair.
    pub fn public_keys(&self) -> PublicKeyResponse {
        PublicKeyResponse {
            key_id: self.key_id.clone(),
            public_key: BASE64.encode(self.agreement_public.as_bytes()),
            sign_public: BASE64.encode(self.signing_public.as_bytes()),
        }
    }

    /// Trust-store record a peer would register for this pair.
    pub fn trust_record(&self, role: Role) -> TrustStoreRecord {
        let keys = self.public_keys();
        TrustStoreRecord {
            key_id: keys.key_id,
            public_key: keys.public_key,
            sign_public: keys.sign_public,
            fingerprint: self.fingerprint.clone(),
            role,
        }
    }

    /// Run `f` with the private halves borrowed under the read lock.
    fn with_private<T>(
        &self,
        f: impl FnOnce(&PrivateHalves) -> Result<T, KeyError>,
    ) -> Result<T, KeyError> {
        let guard = self.private.read().map_err(|_| KeyError::Poisoned)?;
        let halves = guard.as_ref().ok_or(KeyError::Disposed)?;
        f(halves)
    }

    /// Sign `message` with the Ed25519 signing key.
    pub fn sign(&self, message: &[u8]) -> Result<Signature, KeyError> {
        self.with_private(|halves| {
            // SigningKey wipes its copy on drop.
            let key = SigningKey::from_bytes(halves.signing.expose());
            Ok(key.sign(message))
        })
    }

    /// Sign `message` with the token-signing key.
    pub fn sign_token(&self, message: &[u8]) -> Result<Signature, KeyError> {
        self.with_private(|halves| {
            let buf = halves.token.as_ref().ok_or(KeyError::NoTokenKey)?;
            let key = SigningKey::from_bytes(buf.expose());
            Ok(key.sign(message))
        })
    }

    /// X25519 key agreement with a peer's public key.
    ///
    /// Non-contributory results (peer sent a low-order point) are rejected.
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> Result<SharedSecret, KeyError> {
        self.with_private(|halves| {
            let secret = agreement_secret(&halves.agreement);
            let shared = secret.diffie_hellman(their_public);
            crypto::ensure_contributory(&shared)?;
            Ok(shared)
        })
    }

    /// Zero all private halves now.
    ///
    /// Blocks until outstanding borrows finish. Returns `true` if this call
    /// did the wiping, `false` if the pair was already disposed. Wiping also
    /// happens on drop; it never happens twice.
    pub fn dispose(&self) -> bool {
        // Poisoning must not keep key material alive.
        let mut guard = self.private.write().unwrap_or_else(PoisonError::into_inner);
        match guard.take() {
            Some(halves) => {
                drop(halves);
                let _enter = self.span.enter();
                info!(key_id = %self.key_id, "Private key material zeroed");
                true
            }
            None => false,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.private
            .read()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint)
            .field("has_token_key", &self.token_public.is_some())
            .finish_non_exhaustive()
    }
}

/// X25519 secret for a pinned buffer.
///
/// `StaticSecret` only takes its scalar by value, so the copy is staged in a
/// zeroizing slot. Both the slot and the returned secret wipe on drop.
fn agreement_secret(buf: &SecretBuffer<32>) -> StaticSecret {
    let scalar = Zeroizing::new(*buf.expose());
    StaticSecret::from(*scalar)
}

/// Verify an Ed25519 signature with a public key.
pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    crypto::verify_signature(public_key, message, signature)
}

/// Generates key pairs with a fixed entropy source and memory guard.
pub struct KeyPairManager {
    entropy: Arc<dyn EntropySource>,
    guard: Arc<dyn MemoryGuard>,
    span: Span,
}

impl KeyPairManager {
    /// Manager using the OS entropy source and the platform memory guard.
    pub fn new(span: Span) -> Self {
        Self::with_parts(Arc::new(OsEntropy), platform_guard(), span)
    }

    pub fn with_parts(
        entropy: Arc<dyn EntropySource>,
        guard: Arc<dyn MemoryGuard>,
        span: Span,
    ) -> Self {
        Self {
            entropy,
            guard,
            span,
        }
    }

    /// Generate a key-agreement pair and a signing pair.
    pub fn generate(&self) -> Result<KeyPair, KeyError> {
        self.generate_inner(false)
    }

    /// Like [`KeyPairManager::generate`], plus a token-signing key.
    pub fn generate_with_token_key(&self) -> Result<KeyPair, KeyError> {
        self.generate_inner(true)
    }

    fn fresh_secret(&self) -> Result<SecretBuffer<32>, KeyError> {
        SecretBuffer::try_new(self.guard.clone(), |buf| {
            self.entropy.fill(buf).map_err(KeyError::Entropy)
        })
    }

    fn generate_inner(&self, with_token: bool) -> Result<KeyPair, KeyError> {
        let _enter = self.span.enter();

        let agreement = self.fresh_secret()?;
        let signing = self.fresh_secret()?;
        let token = if with_token {
            Some(self.fresh_secret()?)
        } else {
            None
        };

        // Key id comes from its own randomness, not from any public key.
        let mut id_bytes = [0u8; 16];
        self.entropy.fill(&mut id_bytes)?;
        let key_id = uuid::Builder::from_random_bytes(id_bytes)
            .into_uuid()
            .to_string();

        let agreement_public = PublicKey::from(&agreement_secret(&agreement));
        let signing_public = SigningKey::from_bytes(signing.expose()).verifying_key();
        let token_public = token
            .as_ref()
            .map(|buf| SigningKey::from_bytes(buf.expose()).verifying_key());
        let fingerprint = crypto::fingerprint(&signing_public);

        debug!(
            %key_id,
            %fingerprint,
            pinned = agreement.is_locked() && signing.is_locked(),
            "Generated key pair"
        );

        Ok(KeyPair {
            key_id,
            fingerprint,
            agreement_public,
            signing_public,
            token_public,
            private: RwLock::new(Some(PrivateHalves {
                agreement,
                signing,
                token,
            })),
            span: self.span.clone(),
        })
    }
}

impl Default for KeyPairManager {
    fn default() -> Self {
        Self::new(tracing::info_span!("key_manager"))
    }
}
