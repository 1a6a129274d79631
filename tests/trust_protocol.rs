//! End-to-end tests for the trust protocol: role ordering, request
//! authentication, envelopes and session tokens across independent parties.

use chrono::{Duration as ChronoDuration, Utc};
use envtrust::trust::{
    role_at_least, sign_request, AuthError, ContentError, Deadline, EnvelopeCodec,
    EnvelopeConfig, EnvelopeError, Identity, IdentityRegistry, KeyPair, KeyPairManager,
    RequestAuthenticator, SecretPayload, SessionTokenService, SignedRequest, TokenError,
    TokenOptions,
};
use envtrust_types::{EnvelopeWire, Role};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

const ROLES: [Role; 4] = [Role::Reader, Role::Deployer, Role::Admin, Role::Owner];

/// A client and a daemon that trust each other.
struct Peers {
    client: KeyPair,
    daemon: KeyPair,
    /// The daemon's view: knows the client
    daemon_registry: IdentityRegistry,
}

fn peers() -> Peers {
    let manager = KeyPairManager::default();
    let client = manager.generate().unwrap();
    let daemon = manager.generate_with_token_key().unwrap();
    let daemon_registry =
        IdentityRegistry::from_records([client.trust_record(Role::Admin)], Span::none()).unwrap();
    Peers {
        client,
        daemon,
        daemon_registry,
    }
}

fn codec() -> EnvelopeCodec {
    EnvelopeCodec::new(EnvelopeConfig::default(), Span::none())
}

fn var_name() -> impl Strategy<Value = String> {
    "[A-Z][A-Z0-9_]{0,15}"
}

fn var_value() -> impl Strategy<Value = String> {
    // Printable, no '=', no leading/trailing whitespace, no newlines.
    "[a-zA-Z0-9_./:+-]{1,32}"
}

fn payload_strategy() -> impl Strategy<Value = SecretPayload> {
    prop::collection::btree_map(var_name(), var_value(), 1..8)
        .prop_map(|vars| vars.into_iter().collect())
}

#[test]
fn role_order_is_total_and_linear() {
    for (i, actual) in ROLES.iter().enumerate() {
        for (j, required) in ROLES.iter().enumerate() {
            assert_eq!(
                role_at_least(*actual, *required),
                i >= j,
                "{actual} vs {required}"
            );
        }
        assert!(!role_at_least(*actual, Role::Unrecognized));
        assert!(!role_at_least(Role::Unrecognized, *actual));
    }
}

#[test]
fn admin_satisfies_deployer_but_not_owner() {
    let keys = KeyPairManager::default().generate().unwrap();
    let registry = Arc::new(IdentityRegistry::new(Span::none()));
    registry
        .add(
            Identity::new("abc", Role::Admin, keys.public_keys().sign_public)
                .with_key_id(keys.key_id()),
        )
        .unwrap();
    let authenticator = RequestAuthenticator::new(registry, Span::none());

    let body = br#"{"deploy":true}"#;
    let signature = sign_request(&keys, "POST", "/deploy", body).unwrap();
    let request = SignedRequest {
        method: "POST",
        path: "/deploy",
        body,
        signature: Some(signature.as_str()),
        fingerprint: Some("abc"),
    };

    let identity = authenticator
        .authenticate(&request, Role::Deployer, &Deadline::none())
        .unwrap();
    assert_eq!(identity.fingerprint, "abc");
    assert_eq!(identity.role, Role::Admin);

    let err = authenticator
        .authenticate(&request, Role::Owner, &Deadline::none())
        .unwrap_err();
    assert_eq!(
        err,
        AuthError::Forbidden {
            actual: Role::Admin,
            required: Role::Owner
        }
    );
}

#[test]
fn content_scenarios() {
    let parsed = SecretPayload::parse("FOO=bar\n#comment\n\nBAZ=qux").unwrap();
    assert_eq!(parsed.len(), 2);
    assert_eq!(parsed.get("FOO"), Some("bar"));
    assert_eq!(parsed.get("BAZ"), Some("qux"));

    assert!(matches!(
        SecretPayload::parse("FOO"),
        Err(ContentError::Malformed { .. })
    ));

    // The same failure surfaces through the envelope opener.
    let err = EnvelopeError::from(SecretPayload::parse("FOO").unwrap_err());
    assert!(matches!(err, EnvelopeError::MalformedContent(_)));
}

#[test]
fn token_audience_scenario() {
    let p = peers();
    let service = SessionTokenService::new(Span::none());
    let options = TokenOptions {
        audience: vec!["daemon".to_string()],
        ..Default::default()
    };
    let token = service
        .issue_token(Some(&p.daemon), p.client.fingerprint(), &options)
        .unwrap();
    let key = p.daemon.token_public().unwrap();

    let claims = service.verify_token(&token, key, "daemon").unwrap();
    assert_eq!(claims.cid, p.client.fingerprint());
    assert!(matches!(
        service.verify_token(&token, key, "other"),
        Err(TokenError::InvalidAudience)
    ));
}

#[test]
fn token_from_another_daemon_is_rejected() {
    let p = peers();
    let impostor = KeyPairManager::default().generate_with_token_key().unwrap();
    let service = SessionTokenService::new(Span::none());
    let token = service
        .issue_token(Some(&impostor), "client", &TokenOptions::default())
        .unwrap();
    assert!(matches!(
        service.verify_token(&token, p.daemon.token_public().unwrap(), ""),
        Err(TokenError::KeyMismatch)
    ));
}

#[test]
fn envelope_survives_the_wire() {
    let p = peers();
    let secrets: SecretPayload = [("DATABASE_URL", "postgres://db/app"), ("API_KEY", "k")]
        .into_iter()
        .collect();
    let envelope = codec()
        .build_envelope(&p.client, p.daemon.agreement_public(), &secrets)
        .unwrap();

    let json = serde_json::to_string(&envelope.to_wire().unwrap()).unwrap();
    let wire: EnvelopeWire = serde_json::from_str(&json).unwrap();
    let received = envtrust::trust::Envelope::from_wire(&wire).unwrap();

    let opened = codec()
        .open_envelope(&received, &p.daemon_registry, &p.daemon)
        .unwrap();
    assert_eq!(opened, secrets);
}

#[test]
fn envelope_for_someone_else_fails_to_decrypt() {
    let p = peers();
    let bystander = KeyPairManager::default().generate().unwrap();
    let secrets: SecretPayload = [("A", "1")].into_iter().collect();
    let envelope = codec()
        .build_envelope(&p.client, bystander.agreement_public(), &secrets)
        .unwrap();
    let err = codec()
        .open_envelope(&envelope, &p.daemon_registry, &p.daemon)
        .unwrap_err();
    assert!(matches!(err, EnvelopeError::DecryptionFailed));
}

#[test]
fn replay_beyond_skew_is_rejected() {
    let p = peers();
    let secrets: SecretPayload = [("A", "1")].into_iter().collect();
    let created = Utc::now();
    let envelope = codec()
        .build_envelope_at(&p.client, p.daemon.agreement_public(), &secrets, created)
        .unwrap();

    let within = created + ChronoDuration::seconds(299);
    assert!(codec()
        .open_envelope_at(&envelope, &p.daemon_registry, &p.daemon, within)
        .is_ok());

    let replayed = created + ChronoDuration::seconds(301);
    assert!(matches!(
        codec().open_envelope_at(&envelope, &p.daemon_registry, &p.daemon, replayed),
        Err(EnvelopeError::Expired)
    ));

    let early = created - ChronoDuration::seconds(301);
    assert!(matches!(
        codec().open_envelope_at(&envelope, &p.daemon_registry, &p.daemon, early),
        Err(EnvelopeError::NotYetValid)
    ));
}

#[test]
fn nonces_never_repeat() {
    let p = peers();
    let secrets: SecretPayload = [("A", "1")].into_iter().collect();
    let mut seen = HashSet::new();
    for _ in 0..256 {
        let envelope = codec()
            .build_envelope(&p.client, p.daemon.agreement_public(), &secrets)
            .unwrap();
        assert!(seen.insert(envelope.record().unwrap().nonce));
    }
}

#[test]
fn disposed_keys_cannot_open_or_sign() {
    let p = peers();
    let secrets: SecretPayload = [("A", "1")].into_iter().collect();
    let envelope = codec()
        .build_envelope(&p.client, p.daemon.agreement_public(), &secrets)
        .unwrap();

    assert!(p.daemon.dispose());
    assert!(!p.daemon.dispose());
    assert!(matches!(
        codec().open_envelope(&envelope, &p.daemon_registry, &p.daemon),
        Err(EnvelopeError::Key(_))
    ));
    assert!(matches!(
        SessionTokenService::new(Span::none()).issue_token(
            Some(&p.daemon),
            "client",
            &TokenOptions::default()
        ),
        Err(TokenError::NilKey)
    ));
}

#[test]
fn authentication_respects_cancellation() {
    let p = peers();
    let authenticator = RequestAuthenticator::new(Arc::new(p.daemon_registry), Span::none());
    let signature = sign_request(&p.client, "GET", "/status", b"").unwrap();
    let request = SignedRequest {
        method: "GET",
        path: "/status",
        body: b"",
        signature: Some(signature.as_str()),
        fingerprint: Some(p.client.fingerprint()),
    };

    let expired = Deadline::at(std::time::Instant::now() - Duration::from_millis(1));
    assert_eq!(
        authenticator.authenticate(&request, Role::Reader, &expired),
        Err(AuthError::Cancelled)
    );
    assert!(authenticator
        .authenticate(&request, Role::Reader, &Deadline::none())
        .is_ok());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn envelope_round_trip(secrets in payload_strategy(), per_variable in any::<bool>()) {
        let p = peers();
        let codec = EnvelopeCodec::new(
            EnvelopeConfig { per_variable, ..Default::default() },
            Span::none(),
        );
        let envelope = codec
            .build_envelope(&p.client, p.daemon.agreement_public(), &secrets)
            .unwrap();
        let opened = codec
            .open_envelope(&envelope, &p.daemon_registry, &p.daemon)
            .unwrap();
        prop_assert_eq!(opened, secrets);
    }

    #[test]
    fn payload_bit_flip_is_detected(at in any::<prop::sample::Index>(), bit in 0u8..8) {
        let p = peers();
        let secrets: SecretPayload = [("TOKEN", "s3cr3t")].into_iter().collect();
        let mut envelope = codec()
            .build_envelope(&p.client, p.daemon.agreement_public(), &secrets)
            .unwrap();
        let i = at.index(envelope.payload.len());
        envelope.payload[i] ^= 1 << bit;

        let err = codec()
            .open_envelope(&envelope, &p.daemon_registry, &p.daemon)
            .unwrap_err();
        prop_assert!(err.is_tamper(), "unexpected error: {err}");
    }

    #[test]
    fn signature_bit_flip_is_detected(at in any::<prop::sample::Index>(), bit in 0u8..8) {
        let p = peers();
        let secrets: SecretPayload = [("TOKEN", "s3cr3t")].into_iter().collect();
        let mut envelope = codec()
            .build_envelope(&p.client, p.daemon.agreement_public(), &secrets)
            .unwrap();
        let i = at.index(envelope.signature.len());
        envelope.signature[i] ^= 1 << bit;

        let err = codec()
            .open_envelope(&envelope, &p.daemon_registry, &p.daemon)
            .unwrap_err();
        prop_assert!(matches!(err, EnvelopeError::InvalidSignature), "unexpected error: {err}");
    }

    #[test]
    fn request_bit_flip_is_rejected(at in any::<prop::sample::Index>(), bit in 0u8..8) {
        let p = peers();
        let authenticator = RequestAuthenticator::new(Arc::new(p.daemon_registry), Span::none());
        let body = br#"{"agent_id":"ci"}"#.to_vec();
        let signature = sign_request(&p.client, "POST", "/session", &body).unwrap();

        let mut tampered = body.clone();
        let i = at.index(tampered.len());
        tampered[i] ^= 1 << bit;
        let request = SignedRequest {
            method: "POST",
            path: "/session",
            body: &tampered,
            signature: Some(signature.as_str()),
            fingerprint: Some(p.client.fingerprint()),
        };
        prop_assert_eq!(
            authenticator.authenticate(&request, Role::Reader, &Deadline::none()),
            Err(AuthError::InvalidSignature)
        );
    }
}
