//! Signed, encrypted envelopes for moving secrets between principals.
//!
//! Building: X25519 agreement with the recipient, HKDF bound to the sender's
//! key id and the envelope timestamp, ChaCha20-Poly1305 over the rendered
//! `KEY=value` content, then an Ed25519 signature over the exact serialized
//! payload bytes.
//!
//! Opening reverses this, verifying the signature against the sender's
//! registered key before anything inside the payload is trusted.
//!
//! The whole-content `env_blob` is canonical. The optional per-variable map
//! is written for consumers that want single values and is ignored on open.

use super::content::{ContentError, SecretPayload};
use super::crypto::{self, CryptoError};
use super::keys::{KeyError, KeyPair};
use super::registry::IdentityRegistry;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use envtrust_types::{EnvelopeWire, PayloadRecord};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn, Span};
use x25519_dalek::PublicKey;

/// Envelope errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Unknown sender identity")]
    UnknownIdentity,

    #[error("Envelope signature verification failed")]
    InvalidSignature,

    #[error("Envelope payload is not a valid payload record")]
    MalformedPayload,

    #[error("Envelope field has an invalid encoding: {0}")]
    MalformedEncoding(&'static str),

    #[error("Envelope expired")]
    Expired,

    #[error("Envelope timestamp is in the future")]
    NotYetValid,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Malformed secret content: {0}")]
    MalformedContent(#[from] ContentError),

    #[error("Key error: {0}")]
    Key(#[from] KeyError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EnvelopeError {
    /// Failures an altered envelope produces: the payload either cannot be
    /// attributed to a registered signer, fails verification, or fails
    /// decryption.
    pub fn is_tamper(&self) -> bool {
        matches!(
            self,
            EnvelopeError::UnknownIdentity
                | EnvelopeError::InvalidSignature
                | EnvelopeError::MalformedPayload
                | EnvelopeError::DecryptionFailed
        )
    }
}

/// A signed envelope: the serialized payload and a signature over it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Envelope {
    pub fn to_wire(&self) -> Result<EnvelopeWire, EnvelopeError> {
        let payload = String::from_utf8(self.payload.clone())
            .map_err(|_| EnvelopeError::MalformedEncoding("payload"))?;
        Ok(EnvelopeWire {
            payload,
            signature: BASE64.encode(&self.signature),
        })
    }

    pub fn from_wire(wire: &EnvelopeWire) -> Result<Self, EnvelopeError> {
        let signature = BASE64
            .decode(&wire.signature)
            .map_err(|_| EnvelopeError::MalformedEncoding("signature"))?;
        Ok(Self {
            payload: wire.payload.as_bytes().to_vec(),
            signature,
        })
    }

    /// Parse the payload record without verifying anything.
    pub fn record(&self) -> Result<PayloadRecord, EnvelopeError> {
        serde_json::from_slice(&self.payload).map_err(|_| EnvelopeError::MalformedPayload)
    }
}

/// Envelope tuning.
#[derive(Debug, Clone)]
pub struct EnvelopeConfig {
    /// Maximum distance between the envelope timestamp and local time.
    pub max_skew: Duration,
    /// Also write the per-variable ciphertext map.
    pub per_variable: bool,
}

impl Default for EnvelopeConfig {
    fn default() -> Self {
        Self {
            max_skew: Duration::from_secs(300),
            per_variable: false,
        }
    }
}

/// Builds and opens envelopes.
#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    config: EnvelopeConfig,
    span: Span,
}

impl EnvelopeCodec {
    pub fn new(config: EnvelopeConfig, span: Span) -> Self {
        Self { config, span }
    }

    pub fn config(&self) -> &EnvelopeConfig {
        &self.config
    }

    pub fn build_envelope(
        &self,
        sender: &KeyPair,
        recipient: &PublicKey,
        payload: &SecretPayload,
    ) -> Result<Envelope, EnvelopeError> {
        self.build_envelope_at(sender, recipient, payload, Utc::now())
    }

    /// [`EnvelopeCodec::build_envelope`] with an explicit creation time.
    pub fn build_envelope_at(
        &self,
        sender: &KeyPair,
        recipient: &PublicKey,
        payload: &SecretPayload,
        now: DateTime<Utc>,
    ) -> Result<Envelope, EnvelopeError> {
        let _enter = self.span.enter();
        payload.validate()?;

        let timestamp = now.to_rfc3339_opts(SecondsFormat::Millis, true);
        let shared = sender.diffie_hellman(recipient)?;
        let key = crypto::derive_envelope_key(&shared, sender.key_id(), &timestamp)?;
        drop(shared);

        let (nonce, env_blob) = crypto::seal(&key, payload.render().as_bytes())?;

        let variables = if self.config.per_variable {
            let mut map = BTreeMap::new();
            for (name, value) in payload.iter() {
                let (var_nonce, ciphertext) = crypto::seal(&key, value.as_bytes())?;
                let mut sealed = Vec::with_capacity(var_nonce.len() + ciphertext.len());
                sealed.extend_from_slice(&var_nonce);
                sealed.extend_from_slice(&ciphertext);
                map.insert(name.to_string(), BASE64.encode(sealed));
            }
            Some(map)
        } else {
            None
        };

        let record = PayloadRecord {
            key_id: sender.key_id().to_string(),
            env_blob: BASE64.encode(env_blob),
            variables,
            nonce: BASE64.encode(nonce),
            timestamp,
            cli_public_key: BASE64.encode(sender.agreement_public().as_bytes()),
        };
        let payload_bytes = serde_json::to_vec(&record)?;
        let signature = sender.sign(&payload_bytes)?;

        debug!(
            key_id = %record.key_id,
            variables = payload.len(),
            "Built envelope"
        );
        Ok(Envelope {
            payload: payload_bytes,
            signature: signature.to_bytes().to_vec(),
        })
    }

    pub fn open_envelope(
        &self,
        envelope: &Envelope,
        registry: &IdentityRegistry,
        recipient: &KeyPair,
    ) -> Result<SecretPayload, EnvelopeError> {
        self.open_envelope_at(envelope, registry, recipient, Utc::now())
    }

    /// [`EnvelopeCodec::open_envelope`] against an explicit local time.
    pub fn open_envelope_at(
        &self,
        envelope: &Envelope,
        registry: &IdentityRegistry,
        recipient: &KeyPair,
        now: DateTime<Utc>,
    ) -> Result<SecretPayload, EnvelopeError> {
        let _enter = self.span.enter();

        let record = envelope.record()?;
        let sender = registry.lookup_by_key_id(&record.key_id).ok_or_else(|| {
            warn!(key_id = %record.key_id, "Envelope from unknown key id");
            EnvelopeError::UnknownIdentity
        })?;

        let sender_key = sender
            .verifying_key()
            .map_err(|_| EnvelopeError::MalformedEncoding("registered sign_public"))?;
        let signature = crypto::signature_from_bytes(&envelope.signature)
            .map_err(|_| EnvelopeError::InvalidSignature)?;
        if !crypto::verify_signature(&sender_key, &envelope.payload, &signature) {
            warn!(fingerprint = %sender.fingerprint, "Envelope signature mismatch");
            return Err(EnvelopeError::InvalidSignature);
        }

        let created = DateTime::parse_from_rfc3339(&record.timestamp)
            .map_err(|_| EnvelopeError::MalformedEncoding("timestamp"))?
            .with_timezone(&Utc);
        // A skew past chrono's range leaves that edge of the window open.
        let skew = ChronoDuration::from_std(self.config.max_skew).ok();
        let earliest = skew.and_then(|skew| now.checked_sub_signed(skew));
        let latest = skew.and_then(|skew| now.checked_add_signed(skew));
        if earliest.is_some_and(|earliest| created < earliest) {
            warn!(fingerprint = %sender.fingerprint, "Envelope outside skew window (expired)");
            return Err(EnvelopeError::Expired);
        }
        if latest.is_some_and(|latest| created > latest) {
            warn!(fingerprint = %sender.fingerprint, "Envelope outside skew window (future)");
            return Err(EnvelopeError::NotYetValid);
        }

        let sender_public = crypto::parse_x25519_public_key(&record.cli_public_key)
            .map_err(|_| EnvelopeError::MalformedEncoding("cli_public_key"))?;
        let nonce = BASE64
            .decode(&record.nonce)
            .map_err(|_| EnvelopeError::MalformedEncoding("nonce"))?;
        let ciphertext = BASE64
            .decode(&record.env_blob)
            .map_err(|_| EnvelopeError::MalformedEncoding("env_blob"))?;

        let shared = recipient.diffie_hellman(&sender_public)?;
        let key = crypto::derive_envelope_key(&shared, &record.key_id, &record.timestamp)?;
        drop(shared);

        let plaintext = crypto::open(&key, &nonce, &ciphertext).map_err(|e| match e {
            CryptoError::InvalidNonce => EnvelopeError::MalformedEncoding("nonce"),
            _ => EnvelopeError::DecryptionFailed,
        })?;

        let payload = SecretPayload::parse_bytes(&plaintext)?;
        debug!(
            fingerprint = %sender.fingerprint,
            variables = payload.len(),
            "Opened envelope"
        );
        Ok(payload)
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(EnvelopeConfig::default(), tracing::info_span!("envelope_codec"))
    }
}
