//! HTTP adapter for the daemon.
//!
//! Exposes endpoints for:
//! - Getting the daemon's public keys
//! - Checking provisioning status
//! - Issuing session tokens to authenticated callers
//! - Receiving secrets (an envelope addressed to the daemon)
//! - Syncing secrets back out (an envelope addressed to the caller)
//!
//! Everything behind the signature gate gets the caller's [`Identity`] as a
//! request extension.

use crate::error::{AppResult, TrustError};
use crate::trust::auth::{Deadline, RequestAuthenticator, SignedRequest};
use crate::trust::envelope::{Envelope, EnvelopeCodec};
use crate::trust::keys::KeyPair;
use crate::trust::registry::{Identity, IdentityRegistry};
use crate::trust::secrets::{ProvisioningStatus, SharedSecretStore};
use crate::trust::session::{SessionTokenService, TokenOptions};
use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::HeaderMap,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Extension, Json, Router,
};
use envtrust_types::{EnvelopeWire, PublicKeyResponse, Role, FINGERPRINT_HEADER, SIGNATURE_HEADER};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::trace::TraceLayer;
use tracing::info;

/// Largest request body the signature gate will buffer.
pub const MAX_SIGNED_BODY: usize = 1024 * 1024;

/// Response for status endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: ProvisioningStatus,
    pub identities: usize,
}

/// Request body for session issuance.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SessionRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
}

/// Response for session endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionResponse {
    pub token: String,
    pub expires_in: u64,
}

/// Response for push endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct PushResponse {
    pub success: bool,
    pub variables: usize,
}

/// Shared state for daemon endpoints.
pub struct DaemonState {
    pub keys: Arc<KeyPair>,
    pub registry: Arc<IdentityRegistry>,
    pub authenticator: RequestAuthenticator,
    pub codec: EnvelopeCodec,
    pub sessions: SessionTokenService,
    pub token_options: TokenOptions,
    pub secret_store: SharedSecretStore,
    /// Budget for authenticating one request.
    pub auth_timeout: Duration,
}

#[derive(Clone)]
struct RoleGate {
    state: Arc<DaemonState>,
    required: Role,
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Middleware: buffer the body, authenticate, restore the body.
async fn authenticate_request(
    State(gate): State<RoleGate>,
    request: Request,
    next: Next,
) -> Result<Response, TrustError> {
    let (parts, body) = request.into_parts();
    let bytes = to_bytes(body, MAX_SIGNED_BODY)
        .await
        .map_err(|_| TrustError::InvalidRequest("request body unreadable or too large".into()))?;

    let identity = {
        let signed = SignedRequest {
            method: parts.method.as_str(),
            path: parts.uri.path(),
            body: &bytes,
            signature: header(&parts.headers, SIGNATURE_HEADER),
            fingerprint: header(&parts.headers, FINGERPRINT_HEADER),
        };
        let deadline = Deadline::at(Instant::now() + gate.state.auth_timeout);
        gate.state
            .authenticator
            .authenticate(&signed, gate.required, &deadline)?
    };

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(identity);
    Ok(next.run(request).await)
}

/// Handler: GET /pubkey
async fn get_public_key(State(state): State<Arc<DaemonState>>) -> Json<PublicKeyResponse> {
    Json(state.keys.public_keys())
}

/// Handler: GET /status
async fn get_status(State(state): State<Arc<DaemonState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: state.secret_store.status().await,
        identities: state.registry.len(),
    })
}

/// Handler: POST /session
///
/// Issues a session token whose client id is the caller's fingerprint.
async fn issue_session(
    State(state): State<Arc<DaemonState>>,
    Extension(identity): Extension<Identity>,
    body: axum::body::Bytes,
) -> AppResult<Json<SessionResponse>> {
    let request: SessionRequest = if body.is_empty() {
        SessionRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| TrustError::InvalidRequest(e.to_string()))?
    };
    let options = TokenOptions {
        agent_id: request.agent_id,
        ..state.token_options.clone()
    };
    let token = state
        .sessions
        .issue_token(Some(&state.keys), &identity.fingerprint, &options)?;

    Ok(Json(SessionResponse {
        token,
        expires_in: options.expires_in.as_secs(),
    }))
}

/// Handler: POST /secrets/push
///
/// Receives an envelope addressed to the daemon, verifies and decrypts it,
/// and replaces the stored secrets.
async fn push_secrets(
    State(state): State<Arc<DaemonState>>,
    Extension(identity): Extension<Identity>,
    Json(wire): Json<EnvelopeWire>,
) -> AppResult<Json<PushResponse>> {
    let envelope = Envelope::from_wire(&wire)?;
    let record = envelope.record()?;
    if record.key_id != identity.key_id {
        return Err(TrustError::InvalidRequest(
            "envelope sender does not match the authenticated caller".into(),
        ));
    }
    let secrets = state
        .codec
        .open_envelope(&envelope, &state.registry, &state.keys)?;
    let variables = state.secret_store.provision(secrets).await;
    info!(fingerprint = %identity.fingerprint, variables, "Secrets provisioned");

    Ok(Json(PushResponse {
        success: true,
        variables,
    }))
}

/// Handler: POST /secrets/sync
///
/// Returns the stored secrets in an envelope addressed to the caller's
/// registered key-agreement key.
async fn sync_secrets(
    State(state): State<Arc<DaemonState>>,
    Extension(identity): Extension<Identity>,
) -> AppResult<Json<EnvelopeWire>> {
    let recipient = identity
        .agreement_key()
        .ok_or_else(|| TrustError::InvalidRequest("caller has no registered key-agreement key".into()))??;
    let secrets = state
        .secret_store
        .snapshot()
        .await
        .ok_or(TrustError::NotProvisioned)?;
    let envelope = state.codec.build_envelope(&state.keys, &recipient, &secrets)?;
    info!(fingerprint = %identity.fingerprint, variables = secrets.len(), "Secrets synced");

    Ok(Json(envelope.to_wire()?))
}

fn gate(state: &Arc<DaemonState>, required: Role) -> RoleGate {
    RoleGate {
        state: Arc::clone(state),
        required,
    }
}

/// Create the daemon router.
pub fn daemon_router(state: Arc<DaemonState>) -> Router {
    let readers = Router::new()
        .route("/session", post(issue_session))
        .route_layer(middleware::from_fn_with_state(
            gate(&state, Role::Reader),
            authenticate_request,
        ));
    let deployers = Router::new()
        .route("/secrets/sync", post(sync_secrets))
        .route_layer(middleware::from_fn_with_state(
            gate(&state, Role::Deployer),
            authenticate_request,
        ));
    let admins = Router::new()
        .route("/secrets/push", post(push_secrets))
        .route_layer(middleware::from_fn_with_state(
            gate(&state, Role::Admin),
            authenticate_request,
        ));

    Router::new()
        .route("/pubkey", get(get_public_key))
        .route("/status", get(get_status))
        .merge(readers)
        .merge(deployers)
        .merge(admins)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
