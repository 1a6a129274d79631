//! Wire types for the envtrust protocol.
//!
//! These are the JSON shapes exchanged between the daemon and its clients:
//! signed secret envelopes, public-key discovery and trust-store records.
//! Nothing in here performs cryptography; values are carried as base64 text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Header carrying the base64 Ed25519 signature of a request.
pub const SIGNATURE_HEADER: &str = "X-Signature";
/// Header carrying the caller's identity fingerprint.
pub const FINGERPRINT_HEADER: &str = "X-Fingerprint";

/// Access role of a registered identity.
///
/// Roles form a fixed total order `Reader < Deployer < Admin < Owner`.
/// Role names this build does not know deserialize to [`Role::Unrecognized`],
/// which never satisfies any requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Reader,
    Deployer,
    Admin,
    Owner,
    #[serde(other)]
    Unrecognized,
}

impl Role {
    /// Position in the role order, `None` for unrecognized roles.
    pub const fn rank(self) -> Option<u8> {
        match self {
            Role::Reader => Some(0),
            Role::Deployer => Some(1),
            Role::Admin => Some(2),
            Role::Owner => Some(3),
            Role::Unrecognized => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Reader => write!(f, "reader"),
            Role::Deployer => write!(f, "deployer"),
            Role::Admin => write!(f, "admin"),
            Role::Owner => write!(f, "owner"),
            Role::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Signed envelope as it travels on the wire.
///
/// `payload` is the exact JSON text of a [`PayloadRecord`]; the signature is
/// computed over those bytes, so the payload is never re-serialized by a
/// receiver before verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeWire {
    pub payload: String,
    /// Ed25519 signature over `payload` (base64)
    pub signature: String,
}

/// Encrypted secret payload, serialized into [`EnvelopeWire::payload`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRecord {
    /// Key id of the sender's key pair
    pub key_id: String,
    /// ChaCha20-Poly1305 ciphertext of the rendered env content (base64)
    pub env_blob: String,
    /// Optional per-variable ciphertexts, each `nonce || ciphertext` (base64)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<BTreeMap<String, String>>,
    /// Nonce used for `env_blob` (base64, 12 bytes)
    pub nonce: String,
    /// Creation time, RFC 3339 UTC
    pub timestamp: String,
    /// Sender's X25519 public key (base64)
    pub cli_public_key: String,
}

/// Response of the public-key discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyResponse {
    pub key_id: String,
    /// X25519 key-agreement public key (base64)
    pub public_key: String,
    /// Ed25519 signing public key (base64)
    pub sign_public: String,
}

/// One entry of a trust store, as persisted by whoever owns the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustStoreRecord {
    pub key_id: String,
    /// X25519 key-agreement public key (base64), empty if unknown
    #[serde(default)]
    pub public_key: String,
    /// Ed25519 signing public key (base64)
    pub sign_public: String,
    pub fingerprint: String,
    pub role: Role,
}
