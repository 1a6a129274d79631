use envtrust::{
    config::AppConfig,
    trust::{
        self, DaemonState, EnvelopeCodec, EnvelopeConfig, IdentityRegistry, KeyPairManager,
        MemoryGuard, NoopGuard, OsEntropy, RequestAuthenticator, SessionTokenService,
        TokenOptions,
    },
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "envtrust=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting envtrust daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load()?;
    info!("Configuration loaded");

    let guard: Arc<dyn MemoryGuard> = if config.memory.lock {
        trust::platform_guard()
    } else {
        warn!("Memory locking disabled; key material may be swapped to disk");
        Arc::new(NoopGuard)
    };
    let manager = KeyPairManager::with_parts(Arc::new(OsEntropy), guard, info_span!("key_manager"));
    let keys = Arc::new(manager.generate_with_token_key()?);
    info!(key_id = %keys.key_id(), fingerprint = %keys.fingerprint(), "Daemon key pair generated");

    if config.daemon.trust_store.is_empty() {
        warn!("Trust store is empty; every signed request will be rejected");
    }
    let registry = Arc::new(IdentityRegistry::from_records(
        config.daemon.trust_store.clone(),
        info_span!("registry"),
    )?);
    info!(identities = registry.len(), "Trust store loaded");

    let state = Arc::new(DaemonState {
        keys: keys.clone(),
        authenticator: RequestAuthenticator::new(registry.clone(), info_span!("auth")),
        registry,
        codec: EnvelopeCodec::new(EnvelopeConfig::from(&config.envelope), info_span!("envelope")),
        sessions: SessionTokenService::new(info_span!("session")),
        token_options: TokenOptions::from(&config.session),
        secret_store: trust::create_secret_store(),
        auth_timeout: config.daemon.auth_timeout(),
    });

    let addr = config.daemon.bind_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("Daemon listening on http://{}", addr);

    axum::serve(listener, trust::daemon_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    if keys.dispose() {
        info!("Key material disposed");
    }
    info!("Daemon shut down");

    Ok(())
}
