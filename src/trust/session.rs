//! Session tokens for long-lived authenticated channels.
//!
//! Tokens are compact JWS (three base64url segments) signed with EdDSA by
//! the key pair's token-signing key. The header `kid` is a SHA-256 tag of
//! that public key, so a verifier pins to the key it expects without a
//! lookup. Tokens are never renewed in place and there is no revocation
//! list; a token stays valid until `exp`.

use super::crypto;
use super::keys::{KeyError, KeyPair};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::VerifyingKey;
use jsonwebtoken::{decode, decode_header, errors::ErrorKind, Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, Span};

/// Session token errors
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Client id must not be empty")]
    EmptyClientId,

    #[error("No signing key available")]
    NilKey,

    #[error("Unexpected signing method")]
    InvalidSigningMethod,

    #[error("Token key does not match the expected key")]
    KeyMismatch,

    #[error("Token signature verification failed")]
    InvalidSignature,

    #[error("Token not valid yet")]
    NotYetValid,

    #[error("Token expired")]
    Expired,

    #[error("Token audience mismatch")]
    InvalidAudience,

    #[error("Malformed token")]
    Malformed,

    #[error("Token lifetime out of range")]
    InvalidLifetime,

    #[error("Key error: {0}")]
    Key(KeyError),

    #[error("Claims serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<KeyError> for TokenError {
    fn from(err: KeyError) -> Self {
        match err {
            KeyError::NoTokenKey | KeyError::Disposed => TokenError::NilKey,
            other => TokenError::Key(other),
        }
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Client id
    pub cid: String,
    /// Session id
    pub sid: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub iss: String,
    pub aud: Vec<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Per-token issuing options.
#[derive(Debug, Clone)]
pub struct TokenOptions {
    pub expires_in: Duration,
    /// Delay before the token becomes usable.
    pub not_before: Duration,
    pub issuer: String,
    pub audience: Vec<String>,
    pub scope: String,
    pub agent_id: Option<String>,
}

impl Default for TokenOptions {
    fn default() -> Self {
        Self {
            expires_in: Duration::from_secs(15 * 60),
            not_before: Duration::ZERO,
            issuer: "envtrust".to_string(),
            audience: Vec::new(),
            scope: "session".to_string(),
            agent_id: None,
        }
    }
}

/// `base + d` in whole seconds, rejecting lifetimes that overflow `i64`.
fn offset(base: i64, d: Duration) -> Result<i64, TokenError> {
    i64::try_from(d.as_secs())
        .ok()
        .and_then(|secs| base.checked_add(secs))
        .ok_or(TokenError::InvalidLifetime)
}

/// Issues and verifies session tokens.
#[derive(Debug, Clone)]
pub struct SessionTokenService {
    span: Span,
}

impl SessionTokenService {
    pub fn new(span: Span) -> Self {
        Self { span }
    }

    pub fn issue_token(
        &self,
        keys: Option<&KeyPair>,
        client_id: &str,
        options: &TokenOptions,
    ) -> Result<String, TokenError> {
        self.issue_token_at(keys, client_id, options, Utc::now())
    }

    /// [`SessionTokenService::issue_token`] at an explicit issue time.
    pub fn issue_token_at(
        &self,
        keys: Option<&KeyPair>,
        client_id: &str,
        options: &TokenOptions,
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let _enter = self.span.enter();
        if client_id.is_empty() {
            return Err(TokenError::EmptyClientId);
        }
        let keys = keys.ok_or(TokenError::NilKey)?;
        let public = keys.token_public().ok_or(TokenError::NilKey)?;

        let iat = now.timestamp();
        let claims = SessionClaims {
            cid: client_id.to_string(),
            sid: uuid::Uuid::new_v4().to_string(),
            scope: options.scope.clone(),
            agent_id: options.agent_id.clone(),
            iss: options.issuer.clone(),
            aud: options.audience.clone(),
            iat,
            nbf: offset(iat, options.not_before)?,
            exp: offset(iat, options.expires_in)?,
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(crypto::key_tag(public));

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature = keys.sign_token(signing_input.as_bytes())?;

        info!(cid = %claims.cid, sid = %claims.sid, exp = claims.exp, "Issued session token");
        Ok(format!(
            "{}.{}",
            signing_input,
            URL_SAFE_NO_PAD.encode(signature.to_bytes())
        ))
    }

    pub fn verify_token(
        &self,
        token: &str,
        expected_key: &VerifyingKey,
        expected_audience: &str,
    ) -> Result<SessionClaims, TokenError> {
        self.verify_token_at(token, expected_key, expected_audience, Utc::now())
    }

    /// [`SessionTokenService::verify_token`] against an explicit local time.
    pub fn verify_token_at(
        &self,
        token: &str,
        expected_key: &VerifyingKey,
        expected_audience: &str,
        now: DateTime<Utc>,
    ) -> Result<SessionClaims, TokenError> {
        let _enter = self.span.enter();

        let header = decode_header(token).map_err(|_| TokenError::Malformed)?;
        if header.alg != Algorithm::EdDSA {
            debug!(alg = ?header.alg, "Rejected token signing method");
            return Err(TokenError::InvalidSigningMethod);
        }
        if header.kid.as_deref() != Some(crypto::key_tag(expected_key).as_str()) {
            debug!("Rejected token bound to a different key");
            return Err(TokenError::KeyMismatch);
        }

        let decoding_key = DecodingKey::from_ed_components(&URL_SAFE_NO_PAD.encode(expected_key.as_bytes()))
            .map_err(|_| TokenError::Malformed)?;
        // Temporal and audience rules are applied below with exact bounds.
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        let claims = decode::<SessionClaims>(token, &decoding_key, &validation)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                ErrorKind::InvalidAlgorithm => TokenError::InvalidSigningMethod,
                _ => TokenError::Malformed,
            })?
            .claims;

        let now = now.timestamp();
        if now < claims.nbf {
            return Err(TokenError::NotYetValid);
        }
        if now >= claims.exp {
            return Err(TokenError::Expired);
        }
        if !expected_audience.is_empty()
            && claims.aud.first().map(String::as_str) != Some(expected_audience)
        {
            return Err(TokenError::InvalidAudience);
        }

        debug!(cid = %claims.cid, sid = %claims.sid, "Session token verified");
        Ok(claims)
    }
}

impl Default for SessionTokenService {
    fn default() -> Self {
        Self::new(tracing::info_span!("session_tokens"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::keys::KeyPairManager;
    use chrono::Duration as ChronoDuration;

    fn daemon_options() -> TokenOptions {
        TokenOptions {
            audience: vec!["daemon".to_string()],
            ..Default::default()
        }
    }

    fn token_keys() -> KeyPair {
        KeyPairManager::default().generate_with_token_key().unwrap()
    }

    #[test]
    fn issue_and_verify() {
        let keys = token_keys();
        let service = SessionTokenService::default();
        let token = service
            .issue_token(Some(&keys), "cli-1", &daemon_options())
            .unwrap();
        assert_eq!(token.split('.').count(), 3);

        let claims = service
            .verify_token(&token, keys.token_public().unwrap(), "daemon")
            .unwrap();
        assert_eq!(claims.cid, "cli-1");
        assert_eq!(claims.aud, vec!["daemon".to_string()]);
        assert_eq!(claims.iss, "envtrust");
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert!(uuid::Uuid::parse_str(&claims.sid).is_ok());
    }

    #[test]
    fn audience_must_match_first_entry() {
        let keys = token_keys();
        let service = SessionTokenService::default();
        let token = service
            .issue_token(Some(&keys), "cli-1", &daemon_options())
            .unwrap();
        assert!(matches!(
            service.verify_token(&token, keys.token_public().unwrap(), "other"),
            Err(TokenError::InvalidAudience)
        ));
        // Empty expectation skips the audience check.
        assert!(service
            .verify_token(&token, keys.token_public().unwrap(), "")
            .is_ok());
    }

    #[test]
    fn issuing_requires_client_and_key() {
        let service = SessionTokenService::default();
        let keys = token_keys();
        assert!(matches!(
            service.issue_token(Some(&keys), "", &daemon_options()),
            Err(TokenError::EmptyClientId)
        ));
        assert!(matches!(
            service.issue_token(None, "cli", &daemon_options()),
            Err(TokenError::NilKey)
        ));
        let no_token_key = KeyPairManager::default().generate().unwrap();
        assert!(matches!(
            service.issue_token(Some(&no_token_key), "cli", &daemon_options()),
            Err(TokenError::NilKey)
        ));
        keys.dispose();
        assert!(matches!(
            service.issue_token(Some(&keys), "cli", &daemon_options()),
            Err(TokenError::NilKey)
        ));
    }

    #[test]
    fn overflowing_lifetime_is_rejected() {
        let service = SessionTokenService::default();
        let keys = token_keys();
        let huge = TokenOptions {
            expires_in: Duration::from_secs(i64::MAX as u64),
            ..daemon_options()
        };
        assert!(matches!(
            service.issue_token(Some(&keys), "cli", &huge),
            Err(TokenError::InvalidLifetime)
        ));
        let late_start = TokenOptions {
            not_before: Duration::from_secs(u64::MAX),
            ..daemon_options()
        };
        assert!(matches!(
            service.issue_token(Some(&keys), "cli", &late_start),
            Err(TokenError::InvalidLifetime)
        ));
    }

    #[test]
    fn token_is_pinned_to_its_key() {
        let service = SessionTokenService::default();
        let keys = token_keys();
        let other = token_keys();
        let token = service
            .issue_token(Some(&keys), "cli", &daemon_options())
            .unwrap();
        assert!(matches!(
            service.verify_token(&token, other.token_public().unwrap(), "daemon"),
            Err(TokenError::KeyMismatch)
        ));
    }

    #[test]
    fn temporal_window_is_half_open() {
        let service = SessionTokenService::default();
        let keys = token_keys();
        let issued = Utc::now();
        let options = TokenOptions {
            expires_in: Duration::from_secs(60),
            not_before: Duration::from_secs(10),
            ..daemon_options()
        };
        let token = service
            .issue_token_at(Some(&keys), "cli", &options, issued)
            .unwrap();
        let key = keys.token_public().unwrap();

        assert!(matches!(
            service.verify_token_at(&token, key, "daemon", issued),
            Err(TokenError::NotYetValid)
        ));
        assert!(service
            .verify_token_at(&token, key, "daemon", issued + ChronoDuration::seconds(10))
            .is_ok());
        assert!(service
            .verify_token_at(&token, key, "daemon", issued + ChronoDuration::seconds(59))
            .is_ok());
        assert!(matches!(
            service.verify_token_at(&token, key, "daemon", issued + ChronoDuration::seconds(60)),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn wrong_algorithm_is_rejected() {
        let keys = token_keys();
        let claims = SessionClaims {
            cid: "cli".into(),
            sid: "s".into(),
            scope: "session".into(),
            agent_id: None,
            iss: "envtrust".into(),
            aud: vec!["daemon".into()],
            iat: 0,
            nbf: 0,
            exp: i64::MAX,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(b"shared"),
        )
        .unwrap();
        assert!(matches!(
            SessionTokenService::default().verify_token(&token, keys.token_public().unwrap(), "daemon"),
            Err(TokenError::InvalidSigningMethod)
        ));
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let service = SessionTokenService::default();
        let keys = token_keys();
        let token = service
            .issue_token(Some(&keys), "cli", &daemon_options())
            .unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let mut claims: SessionClaims =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        claims.scope = "admin".to_string();
        let forged = format!(
            "{}.{}.{}",
            parts[0],
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap()),
            parts[2]
        );
        assert!(matches!(
            service.verify_token(&forged, keys.token_public().unwrap(), "daemon"),
            Err(TokenError::InvalidSignature)
        ));
        assert!(matches!(
            service.verify_token("not.a.token", keys.token_public().unwrap(), "daemon"),
            Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn agent_id_is_carried() {
        let service = SessionTokenService::default();
        let keys = token_keys();
        let options = TokenOptions {
            agent_id: Some("agent-7".to_string()),
            scope: "sync".to_string(),
            ..daemon_options()
        };
        let token = service.issue_token(Some(&keys), "cli", &options).unwrap();
        let claims = service
            .verify_token(&token, keys.token_public().unwrap(), "daemon")
            .unwrap();
        assert_eq!(claims.agent_id.as_deref(), Some("agent-7"));
        assert_eq!(claims.scope, "sync");
    }
}
