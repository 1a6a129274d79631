//! Cryptographic trust layer.
//!
//! Provides identity-based access control and confidential delivery of
//! secret configuration between mutually authenticated principals.
//!
//! ## Security Model
//!
//! - Every principal is an [`Identity`] in the [`IdentityRegistry`], keyed by
//!   the fingerprint of its Ed25519 verification key and holding one role
//! - Requests carry an Ed25519 signature over method, path and body; the
//!   [`RequestAuthenticator`] checks it before checking the role
//! - Secrets travel in signed envelopes: X25519 agreement, HKDF-SHA256 key
//!   derivation, ChaCha20-Poly1305 encryption
//! - Private key halves are pinned (where the platform allows) and zeroized
//!   on disposal
//! - Session tokens are EdDSA-signed JWS with a bounded lifetime
//!
//! ## Usage
//!
//! ```ignore
//! let manager = KeyPairManager::default();
//! let daemon = manager.generate_with_token_key()?;
//!
//! let registry = Arc::new(IdentityRegistry::from_records(records, span)?);
//! let authenticator = RequestAuthenticator::new(registry.clone(), span);
//!
//! // Open an envelope pushed by a registered client
//! let secrets = EnvelopeCodec::default().open_envelope(&envelope, &registry, &daemon)?;
//! ```

pub mod auth;
pub mod content;
pub mod crypto;
pub mod envelope;
pub mod keys;
pub mod memory;
pub mod registry;
pub mod secrets;
pub mod session;
pub mod transport;

pub use auth::{sign_request, AuthError, Deadline, Rejection, RequestAuthenticator, SignedRequest};
pub use content::{ContentError, SecretPayload};
pub use crypto::CryptoError;
pub use envelope::{Envelope, EnvelopeCodec, EnvelopeConfig, EnvelopeError};
pub use keys::{EntropySource, KeyError, KeyPair, KeyPairManager, OsEntropy};
pub use memory::{platform_guard, MemoryGuard, NoopGuard, SecretBuffer};
pub use registry::{role_at_least, Identity, IdentityRegistry, RegistryError};
pub use secrets::{create_secret_store, ProvisioningStatus, SecretStore, SharedSecretStore};
pub use session::{SessionClaims, SessionTokenService, TokenError, TokenOptions};
pub use transport::{daemon_router, DaemonState};
