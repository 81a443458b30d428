//! blink402 HTTP entrypoint.
//!
//! Launches the Axum server exposing the payment-gated proxy:
//!
//! - `POST /{slug}` — execute a priced (or reward) call
//! - `GET /{slug}/challenge` — obtain a reward challenge
//! - `GET /health` — store liveness
//!
//! Startup wires the dependency graph explicitly: PostgreSQL pool (with
//! migrations), Redis connection, Solana RPC provider, facilitator client,
//! and the two platform keypairs, all threaded into the orchestrator's
//! `Deps`. Environment comes from `.env` plus process env; `HOST`/`PORT`
//! control binding.

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use solana_signer::Signer;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tower_http::cors;

use blink402::challenge::ChallengeService;
use blink402::chain::ChainProvider;
use blink402::config::Config;
use blink402::kv::{
    ChallengeStore, Kv, MutexService, OfferCache, RateLimiter, ResponseCache,
};
use blink402::payment::{FacilitatorClient, PaymentVerifier};
use blink402::proxy::{self, Deps};
use blink402::refund::RefundManager;
use blink402::reward::RewardDisburser;
use blink402::store::{self, ClaimStore, OfferStore, RefundStore, RunStore};
use blink402::telemetry::Telemetry;
use blink402::upstream::UpstreamDispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = Config::load();

    let pool = store::connect(&config.database_url, config.database_max_connections).await?;
    let kv = Kv::connect(&config.redis_url).await?;

    let chain = Arc::new(ChainProvider::new(
        config.rpc_url.to_string(),
        config.network,
    ));
    let facilitator =
        FacilitatorClient::try_new(config.facilitator_url.clone(), Duration::from_secs(10))?;

    let funded_keypair = Arc::new(config.funded_wallet_key.keypair());
    let refund_keypair = Arc::new(config.refund_wallet_key.keypair());
    if refund_keypair.pubkey() != *config.treasury.pubkey() {
        tracing::warn!(
            treasury = %config.treasury,
            refund_wallet = %refund_keypair.pubkey(),
            "Refund wallet differs from treasury"
        );
    }

    let deps = Arc::new(Deps {
        network: config.network,
        public_base_url: config.public_base_url.clone(),
        pool: pool.clone(),
        kv: kv.clone(),
        offers: OfferStore::new(pool.clone()),
        runs: RunStore::new(pool.clone()),
        claims: ClaimStore::new(pool.clone()),
        mutex: MutexService::new(kv.clone()),
        lock_options: config.lock_options(),
        responses: ResponseCache::new(kv.clone()),
        offer_cache: OfferCache::new(kv.clone()),
        rate_limiter: RateLimiter::new(
            kv.clone(),
            config.rate_limit_charge_per_hour,
            config.rate_limit_reward_per_hour,
        ),
        challenges: ChallengeService::new(ChallengeStore::new(kv.clone())),
        verifier: PaymentVerifier::new(facilitator, chain.clone()),
        upstream: UpstreamDispatcher::new(
            config.api_base_url.clone(),
            config.upstream_timeout(),
            config.max_response_bytes,
        ),
        reward: RewardDisburser::new(chain.clone(), funded_keypair),
        refunds: RefundManager::new(chain, refund_keypair, RefundStore::new(pool)),
    });

    let http_endpoints = Router::new()
        .merge(proxy::routes().with_state(deps))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    // Graceful shutdown on SIGTERM/SIGINT; registration errors surface at
    // startup rather than inside the shutdown future.
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let graceful_shutdown = async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("SIGTERM received, shutting down"),
            _ = sigint.recv() => tracing::info!("SIGINT received, shutting down"),
        }
    };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(graceful_shutdown)
        .await?;

    Ok(())
}
