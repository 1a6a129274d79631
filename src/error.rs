use crate::trust::auth::{AuthError, Rejection};
use crate::trust::crypto::CryptoError;
use crate::trust::envelope::EnvelopeError;
use crate::trust::keys::KeyError;
use crate::trust::registry::RegistryError;
use crate::trust::session::TokenError;
use thiserror::Error;

/// Application-wide error types
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Key management error: {0}")]
    Key(#[from] KeyError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Session token error: {0}")]
    Token(#[from] TokenError),

    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No secrets provisioned")]
    NotProvisioned,
}

/// Failure classes of the trust protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Missing or malformed headers and encodings
    Credential,
    /// Unknown fingerprint or key id
    Identity,
    /// Role insufficient
    Authorization,
    /// Signature verification failure
    Signature,
    /// Decryption/tamper failure, malformed content, replay or expiry
    Protocol,
    /// Key generation or disposal failure
    KeyManagement,
    /// Session token rejected or not issuable
    Token,
    Configuration,
    Request,
    Internal,
}

impl TrustError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Key(_) => ErrorCategory::KeyManagement,
            Self::Registry(RegistryError::InvalidRecord { .. }) => ErrorCategory::Configuration,
            Self::Registry(_) => ErrorCategory::Identity,
            Self::Auth(e) => match e {
                AuthError::MissingCredentials | AuthError::MalformedEncoding => ErrorCategory::Credential,
                AuthError::UnknownIdentity => ErrorCategory::Identity,
                AuthError::Forbidden { .. } => ErrorCategory::Authorization,
                AuthError::InvalidSignature => ErrorCategory::Signature,
                AuthError::Cancelled => ErrorCategory::Request,
            },
            Self::Envelope(e) => match e {
                EnvelopeError::UnknownIdentity => ErrorCategory::Identity,
                EnvelopeError::InvalidSignature | EnvelopeError::MalformedPayload => {
                    ErrorCategory::Signature
                }
                EnvelopeError::MalformedEncoding(_) => ErrorCategory::Credential,
                EnvelopeError::Key(_) => ErrorCategory::KeyManagement,
                EnvelopeError::Serialization(_) => ErrorCategory::Internal,
                EnvelopeError::Expired
                | EnvelopeError::NotYetValid
                | EnvelopeError::DecryptionFailed
                | EnvelopeError::MalformedContent(_)
                | EnvelopeError::Crypto(_) => ErrorCategory::Protocol,
            },
            Self::Token(TokenError::Key(_)) => ErrorCategory::KeyManagement,
            Self::Token(_) => ErrorCategory::Token,
            Self::Crypto(_) => ErrorCategory::Credential,
            Self::InvalidRequest(_) | Self::NotProvisioned => ErrorCategory::Request,
        }
    }

    /// Message safe to show a remote caller.
    ///
    /// Authentication failures collapse to unauthorized / forbidden /
    /// malformed so callers cannot tell which check failed.
    pub fn public_message(&self) -> String {
        match self {
            Self::Auth(e) => match e.rejection() {
                Rejection::Unauthorized => "unauthorized".to_string(),
                Rejection::Forbidden => "forbidden".to_string(),
                Rejection::MalformedRequest => "malformed request".to_string(),
                Rejection::Unavailable => "request abandoned".to_string(),
            },
            Self::Envelope(_) | Self::Crypto(_) => "envelope rejected".to_string(),
            Self::Token(_) => "session token rejected".to_string(),
            Self::InvalidRequest(msg) => msg.clone(),
            Self::NotProvisioned => self.to_string(),
            Self::Config(_) | Self::Key(_) | Self::Registry(_) => "internal error".to_string(),
        }
    }
}

/// Result type alias using TrustError
pub type AppResult<T> = Result<T, TrustError>;

/// Convert TrustError to HTTP status codes for web responses
impl TrustError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Auth(e) => match e.rejection() {
                Rejection::Unauthorized => StatusCode::UNAUTHORIZED,
                Rejection::Forbidden => StatusCode::FORBIDDEN,
                Rejection::MalformedRequest => StatusCode::BAD_REQUEST,
                Rejection::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            },
            Self::Envelope(EnvelopeError::Key(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Envelope(EnvelopeError::Serialization(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Envelope(_) => StatusCode::BAD_REQUEST,
            Self::Crypto(_) => StatusCode::BAD_REQUEST,
            Self::Token(TokenError::Key(_)) | Self::Token(TokenError::Serialization(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Token(TokenError::EmptyClientId) => StatusCode::BAD_REQUEST,
            Self::Token(TokenError::NilKey) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Token(_) => StatusCode::UNAUTHORIZED,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotProvisioned => StatusCode::CONFLICT,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Key(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for TrustError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, "Request rejected");
        }
        let body = serde_json::json!({
            "error": self.public_message(),
            "code": status.as_u16()
        });
        (status, axum::Json(body)).into_response()
    }
}
