//! Per-request signature authentication and role checks.
//!
//! A caller signs the canonical message `"<METHOD> <PATH> <BODY>"` with its
//! Ed25519 key and sends the signature in `X-Signature` next to its
//! fingerprint in `X-Fingerprint`.

use super::crypto;
use super::keys::{KeyError, KeyPair};
use super::registry::{role_at_least, Identity, IdentityRegistry};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use envtrust_types::Role;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn, Span};

/// Authentication failures
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing signature or fingerprint header")]
    MissingCredentials,

    #[error("Unknown identity")]
    UnknownIdentity,

    #[error("Role {actual} does not satisfy {required}")]
    Forbidden { actual: Role, required: Role },

    #[error("Malformed signature or key encoding")]
    MalformedEncoding,

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Authentication cancelled")]
    Cancelled,
}

/// What a remote caller is allowed to learn about an auth failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Unauthorized,
    Forbidden,
    MalformedRequest,
    Unavailable,
}

impl AuthError {
    pub fn rejection(&self) -> Rejection {
        match self {
            AuthError::MissingCredentials
            | AuthError::UnknownIdentity
            | AuthError::InvalidSignature => Rejection::Unauthorized,
            AuthError::Forbidden { .. } => Rejection::Forbidden,
            AuthError::MalformedEncoding => Rejection::MalformedRequest,
            AuthError::Cancelled => Rejection::Unavailable,
        }
    }
}

/// Externally supplied deadline and cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct Deadline {
    at: Option<Instant>,
    cancelled: Option<Arc<AtomicBool>>,
}

impl Deadline {
    /// No deadline, not cancellable.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            cancelled: None,
        }
    }

    /// Also abandon once `flag` is set.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(flag);
        self
    }

    pub fn check(&self) -> Result<(), AuthError> {
        let expired = self.at.is_some_and(|at| Instant::now() >= at);
        let cancelled = self
            .cancelled
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Acquire));
        if expired || cancelled {
            Err(AuthError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A request as seen by the authenticator.
#[derive(Debug, Clone, Copy)]
pub struct SignedRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    /// `X-Signature` header value
    pub signature: Option<&'a str>,
    /// `X-Fingerprint` header value
    pub fingerprint: Option<&'a str>,
}

/// The canonical signed message: `"<METHOD> <PATH> <BODY>"`.
pub fn canonical_message(method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(method.len() + path.len() + body.len() + 2);
    message.extend_from_slice(method.as_bytes());
    message.push(b' ');
    message.extend_from_slice(path.as_bytes());
    message.push(b' ');
    message.extend_from_slice(body);
    message
}

/// Client side: produce the `X-Signature` header value for a request.
pub fn sign_request(keys: &KeyPair, method: &str, path: &str, body: &[u8]) -> Result<String, KeyError> {
    let signature = keys.sign(&canonical_message(method, path, body))?;
    Ok(BASE64.encode(signature.to_bytes()))
}

/// Verifies request signatures against the registry and enforces roles.
#[derive(Debug, Clone)]
pub struct RequestAuthenticator {
    registry: Arc<IdentityRegistry>,
    span: Span,
}

impl RequestAuthenticator {
    pub fn new(registry: Arc<IdentityRegistry>, span: Span) -> Self {
        Self { registry, span }
    }

    /// Authenticate `request` and require `required` or better.
    ///
    /// Reads nothing but borrowed inputs and mutates nothing. The signature
    /// is verified before the role check, so an unauthenticated caller
    /// cannot probe which role an identity holds.
    pub fn authenticate(
        &self,
        request: &SignedRequest<'_>,
        required: Role,
        deadline: &Deadline,
    ) -> Result<Identity, AuthError> {
        let _enter = self.span.enter();
        deadline.check()?;

        let (Some(signature), Some(fingerprint)) = (request.signature, request.fingerprint) else {
            debug!(method = request.method, path = request.path, "Missing credentials");
            return Err(AuthError::MissingCredentials);
        };

        let identity = self.registry.lookup(fingerprint).ok_or_else(|| {
            warn!(%fingerprint, "Request from unknown identity");
            AuthError::UnknownIdentity
        })?;

        let signature = crypto::parse_signature(signature).map_err(|_| AuthError::MalformedEncoding)?;
        let public_key = identity
            .verifying_key()
            .map_err(|_| AuthError::MalformedEncoding)?;

        deadline.check()?;
        let message = canonical_message(request.method, request.path, request.body);
        if !crypto::verify_signature(&public_key, &message, &signature) {
            warn!(%fingerprint, method = request.method, path = request.path, "Invalid request signature");
            return Err(AuthError::InvalidSignature);
        }

        if !role_at_least(identity.role, required) {
            warn!(%fingerprint, role = %identity.role, %required, "Insufficient role");
            return Err(AuthError::Forbidden {
                actual: identity.role,
                required,
            });
        }

        deadline.check()?;
        debug!(%fingerprint, role = %identity.role, "Request authenticated");
        Ok(identity)
    }
}
