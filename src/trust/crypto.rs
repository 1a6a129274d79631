//! Cryptographic primitives for the trust protocol.
//!
//! Uses:
//! - Ed25519 for request, envelope and session-token signatures
//! - X25519 for key agreement
//! - HKDF-SHA256 to bind the shared secret to an envelope's context
//! - ChaCha20-Poly1305 for authenticated encryption

use base64::{
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
    Engine,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use ed25519_dalek::{Signature, VerifyingKey};
use hkdf::Hkdf;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, SharedSecret};
use zeroize::Zeroizing;

/// Length of a ChaCha20-Poly1305 nonce.
pub const NONCE_LEN: usize = 12;

const HKDF_SALT: &[u8] = b"envtrust-envelope-v1";

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid base64 encoding: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid public key format")]
    InvalidPublicKey,

    #[error("Invalid signature format")]
    InvalidSignature,

    #[error("Decryption failed - invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Invalid nonce length")]
    InvalidNonce,

    #[error("Key agreement produced a non-contributory shared secret")]
    WeakKeyAgreement,

    #[error("Entropy source failure: {0}")]
    Entropy(#[from] rand::Error),
}

/// Result type for crypto operations
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Parse an X25519 public key from base64.
pub fn parse_x25519_public_key(base64_key: &str) -> CryptoResult<PublicKey> {
    let bytes = BASE64.decode(base64_key)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(PublicKey::from(arr))
}

/// Parse an Ed25519 verifying key from base64.
pub fn parse_ed25519_public_key(base64_key: &str) -> CryptoResult<VerifyingKey> {
    let bytes = BASE64.decode(base64_key)?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    VerifyingKey::from_bytes(&arr).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Parse an Ed25519 signature from raw bytes.
pub fn signature_from_bytes(bytes: &[u8]) -> CryptoResult<Signature> {
    let arr: [u8; 64] = bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
    Ok(Signature::from_bytes(&arr))
}

/// Parse an Ed25519 signature from base64.
pub fn parse_signature(base64_sig: &str) -> CryptoResult<Signature> {
    let bytes = BASE64.decode(base64_sig)?;
    signature_from_bytes(&bytes)
}

/// Verify an Ed25519 signature.
///
/// Uses strict verification (rejects small-order keys and non-canonical
/// signatures). The underlying comparison does not branch on secret data.
pub fn verify_signature(public_key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    public_key.verify_strict(message, signature).is_ok()
}

/// Reject all-zero (low-order point) key agreement results.
pub fn ensure_contributory(shared: &SharedSecret) -> CryptoResult<()> {
    if shared.was_contributory() {
        Ok(())
    } else {
        Err(CryptoError::WeakKeyAgreement)
    }
}

/// Derive the envelope encryption key from a shared secret.
///
/// The HKDF info binds the key to the sender's key id and the envelope
/// timestamp, so one shared secret yields a different key per envelope.
pub fn derive_envelope_key(
    shared_secret: &SharedSecret,
    key_id: &str,
    timestamp: &str,
) -> CryptoResult<Zeroizing<[u8; 32]>> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), shared_secret.as_bytes());
    let mut info = Vec::with_capacity(key_id.len() + timestamp.len() + 1);
    info.extend_from_slice(key_id.as_bytes());
    info.push(b'|');
    info.extend_from_slice(timestamp.as_bytes());

    let mut key = Zeroizing::new([0u8; 32]);
    hk.expand(&info, &mut key[..])
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(key)
}

/// Fill a fresh 96-bit nonce from the OS entropy source.
pub fn generate_nonce() -> CryptoResult<[u8; NONCE_LEN]> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.try_fill_bytes(&mut nonce)?;
    Ok(nonce)
}

/// Encrypt with ChaCha20-Poly1305 under a fresh random nonce.
///
/// Returns `(nonce, ciphertext)`.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> CryptoResult<([u8; NONCE_LEN], Vec<u8>)> {
    let nonce_bytes = generate_nonce()?;
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok((nonce_bytes, ciphertext))
}

/// Decrypt a ChaCha20-Poly1305 ciphertext.
///
/// The plaintext is returned in a zeroizing buffer. On tag mismatch nothing
/// but [`CryptoError::DecryptionFailed`] comes back.
pub fn open(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> CryptoResult<Zeroizing<Vec<u8>>> {
    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::InvalidNonce);
    }
    let cipher = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CryptoError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Key-identification tag for an Ed25519 public key.
///
/// base64url (no padding) of SHA-256 over the canonical 32-byte encoding.
pub fn key_tag(public_key: &VerifyingKey) -> String {
    let digest = Sha256::digest(public_key.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Short fingerprint of an Ed25519 public key: 16 hex chars of BLAKE3.
pub fn fingerprint(public_key: &VerifyingKey) -> String {
    let hash = blake3::hash(public_key.as_bytes());
    hash.to_hex().as_str()[..16].to_string()
}
