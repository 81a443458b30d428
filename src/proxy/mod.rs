//! The proxy orchestrator: one entry point that composes offer lookup, rate
//! limiting, the payment mutex, verification, upstream dispatch, reward
//! disbursement, refunds, and the idempotent response cache.
//!
//! Endpoints:
//! - `POST /{slug}` — the priced call (charge or reward, by offer mode)
//! - `GET /{slug}/challenge` — issue a reward challenge
//! - `GET /` — greeting, `GET /health` — liveness of the two stores
//!
//! The charge path holds the distributed mutex on the payment identifier
//! for the whole verify-and-execute sequence, so state transitions of one
//! run are linearizable even across replicas. Everything before the mutex
//! (validation, rate limiting, the 402 answer) touches no state.

pub mod request;
pub mod response;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use serde_json::{Value as JsonValue, json};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;
use url::Url;
use uuid::Uuid;

use crate::challenge::ChallengeService;
use crate::chain::{Address, Reference, SolanaNetwork};
use crate::error::ProxyError;
use crate::kv::{Kv, LockOptions, MutexService, OfferCache, RateBucket, RateLimiter, ResponseCache};
use crate::payment::{PaymentProof, PaymentRequirements, PaymentVerifier};
use crate::refund::{RefundManager, RefundOutcome};
use crate::reward::RewardDisburser;
use crate::store::{
    ClaimStore, Offer, OfferMode, OfferStore, Run, RunStatus, RunStore, StoreError,
};
use crate::upstream::UpstreamDispatcher;

use request::{ChargeInit, ProxyRequest, RewardClaim};

/// Everything the orchestrator needs, threaded in at construction. No
/// module-level mutable state anywhere.
pub struct Deps {
    pub network: SolanaNetwork,
    pub public_base_url: Option<Url>,
    pub pool: PgPool,
    pub kv: Kv,
    pub offers: OfferStore,
    pub runs: RunStore,
    pub claims: ClaimStore,
    pub mutex: MutexService,
    pub lock_options: LockOptions,
    pub responses: ResponseCache,
    pub offer_cache: OfferCache,
    pub rate_limiter: RateLimiter,
    pub challenges: ChallengeService,
    pub verifier: PaymentVerifier,
    pub upstream: UpstreamDispatcher,
    pub reward: RewardDisburser,
    pub refunds: RefundManager,
}

impl Deps {
    /// The resource URL advertised to the facilitator for a slug.
    fn resource_for(&self, slug: &str) -> String {
        match &self.public_base_url {
            Some(base) => {
                let base = base.as_str().trim_end_matches('/');
                format!("{base}/{slug}")
            }
            None => format!("/{slug}"),
        }
    }
}

pub fn routes() -> Router<Arc<Deps>> {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
        .route("/{slug}", post(post_offer))
        .route("/{slug}/challenge", get(get_challenge))
}

#[instrument(skip_all)]
async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
async fn get_health(State(deps): State<Arc<Deps>>) -> impl IntoResponse {
    let database = sqlx::query("SELECT 1").execute(&deps.pool).await.is_ok();
    let cache = deps.kv.get_string("health:probe").await.is_ok();
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(json!({ "database": database, "cache": cache })))
}

#[derive(serde::Deserialize)]
struct ChallengeQuery {
    wallet: String,
}

/// `GET /{slug}/challenge?wallet=W`: issues a single-use signed challenge
/// for a reward offer.
#[instrument(skip_all, fields(slug = %slug))]
async fn get_challenge(
    State(deps): State<Arc<Deps>>,
    Path(slug): Path<String>,
    Query(query): Query<ChallengeQuery>,
) -> Result<impl IntoResponse, ProxyError> {
    let offer = lookup_offer(&deps, &slug).await?;
    if offer.mode != OfferMode::Reward {
        return Err(ProxyError::Validation(
            "Challenges exist only for reward offers".to_string(),
        ));
    }
    let wallet = query
        .wallet
        .parse::<Address>()
        .map_err(ProxyError::Validation)?;
    let issued = deps
        .challenges
        .issue(&wallet, offer.id)
        .await
        .map_err(ProxyError::Challenge)?;
    Ok((StatusCode::OK, Json(issued)))
}

/// `POST /{slug}`: the priced call.
#[instrument(skip_all, fields(slug = %slug))]
async fn post_offer(
    State(deps): State<Arc<Deps>>,
    Path(slug): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ProxyError> {
    let body: JsonValue = if body.is_empty() {
        json!({})
    } else {
        serde_json::from_slice(&body)
            .map_err(|_| ProxyError::Validation("Request body must be JSON".to_string()))?
    };

    let offer = lookup_offer(&deps, &slug).await?;
    if !offer.is_active() {
        return Err(ProxyError::OfferNotActive);
    }

    let parsed = ProxyRequest::from_parts(&headers, &body)?;

    if let Some(wallet) = parsed.rate_limit_wallet() {
        let bucket = match offer.mode {
            OfferMode::Charge => RateBucket::Charge,
            OfferMode::Reward => RateBucket::Reward,
        };
        let decision = deps.rate_limiter.check(bucket, &wallet).await;
        if !decision.allowed {
            return Err(ProxyError::RateLimited {
                wallet: wallet.truncated(),
                decision,
            });
        }
    }

    let body = match (offer.mode, parsed) {
        (OfferMode::Charge, ProxyRequest::RewardClaim(_)) => {
            return Err(ProxyError::Validation(
                "Challenge fields are not accepted on charge offers".to_string(),
            ));
        }
        (OfferMode::Reward, ProxyRequest::RewardClaim(claim)) => {
            handle_reward(&deps, &offer, claim).await?
        }
        (OfferMode::Reward, _) => {
            return Err(ProxyError::Validation(
                "Reward offers require a signed challenge".to_string(),
            ));
        }
        (OfferMode::Charge, ProxyRequest::ChargeInit(init)) => {
            handle_charge_init(&deps, &offer, init).await?
        }
        (OfferMode::Charge, ProxyRequest::ChargeWithEnvelope(charge)) => {
            handle_charge_proof(
                &deps,
                &offer,
                charge.reference,
                ChargeProof::Envelope(charge.envelope),
                charge.forwarded,
                charge.idempotency_key,
            )
            .await?
        }
        (OfferMode::Charge, ProxyRequest::ChargeWithTxHash(charge)) => {
            handle_charge_proof(
                &deps,
                &offer,
                charge.reference,
                ChargeProof::TxHash(charge.tx_hash),
                charge.forwarded,
                charge.idempotency_key,
            )
            .await?
        }
    };

    Ok((StatusCode::OK, Json(body)))
}

/// Proof material for a charge before the reference is pinned down.
enum ChargeProof {
    Envelope(crate::payment::PaymentEnvelope),
    TxHash(String),
    Reference,
}

async fn lookup_offer(deps: &Deps, slug: &str) -> Result<Offer, ProxyError> {
    let offers = deps.offers.clone();
    let fetched = deps
        .offer_cache
        .get_or_fetch(slug, || {
            let slug = slug.to_string();
            async move { offers.get_by_slug(&slug).await }
        })
        .await
        .map_err(ProxyError::from)?;
    fetched.ok_or(ProxyError::NotFound)
}

/// A charge with no proof at all answers 402; one with just a reference
/// goes through the on-chain scan strategy.
async fn handle_charge_init(
    deps: &Deps,
    offer: &Offer,
    init: ChargeInit,
) -> Result<JsonValue, ProxyError> {
    let Some(reference) = init.reference else {
        let description = offer
            .description
            .clone()
            .unwrap_or_else(|| offer.title.clone());
        return Err(ProxyError::PaymentRequired {
            requirements: Box::new(PaymentRequirements::for_offer(offer, deps.network)),
            description,
        });
    };
    handle_charge_proof(
        deps,
        offer,
        Some(reference),
        ChargeProof::Reference,
        init.forwarded,
        init.idempotency_key,
    )
    .await
}

async fn handle_charge_proof(
    deps: &Deps,
    offer: &Offer,
    reference: Option<Reference>,
    proof: ChargeProof,
    forwarded: request::Forwarded,
    idempotency_key: Option<String>,
) -> Result<JsonValue, ProxyError> {
    offer
        .validate_inputs(&forwarded)
        .map_err(ProxyError::Validation)?;

    // The payment identifier keys the mutex, the run, and the idempotency
    // cache: the tx hash when the client supplied one, else the reference
    // (minted here if the client left the choice to us).
    let reference = reference.unwrap_or_else(Reference::new_rand);
    let (identifier, proof) = match proof {
        ChargeProof::Envelope(envelope) => {
            (reference.to_string(), PaymentProof::Envelope(envelope))
        }
        ChargeProof::TxHash(hash) => (hash.clone(), PaymentProof::TxHash(hash)),
        ChargeProof::Reference => (
            reference.to_string(),
            PaymentProof::OnChainReference(reference),
        ),
    };

    let lock_key = format!("lock:payment:{identifier}");
    deps.mutex
        .with_lock(&lock_key, &deps.lock_options, || {
            execute_charge(
                deps,
                offer,
                reference,
                proof,
                identifier.clone(),
                forwarded,
                idempotency_key,
            )
        })
        .await
        .map_err(|_| ProxyError::Contention)?
}

/// The serialized section of a charge: everything from idempotency check to
/// execution happens while holding the payment mutex.
async fn execute_charge(
    deps: &Deps,
    offer: &Offer,
    reference: Reference,
    proof: PaymentProof,
    identifier: String,
    forwarded: request::Forwarded,
    idempotency_key: Option<String>,
) -> Result<JsonValue, ProxyError> {
    if let Some(cached) = cached_response(deps, &identifier, idempotency_key.as_deref()).await {
        return Ok(cached);
    }

    let mut run = match deps.runs.get_by_reference(&reference.to_string()).await? {
        Some(run) => run,
        None => {
            // A client retrying a trusted tx-hash may omit the original
            // reference; the signature index finds the run it started.
            let adopted = match &proof {
                PaymentProof::TxHash(hash) => deps
                    .runs
                    .get_by_signature(hash)
                    .await?
                    .filter(|run| run.offer_id == offer.id),
                _ => None,
            };
            match adopted {
                Some(run) => run,
                None => {
                    deps.runs
                        .create_run(
                            offer.id,
                            &reference.to_string(),
                            JsonValue::Object(forwarded.clone()),
                        )
                        .await?
                }
            }
        }
    };
    let reference_str = run.reference.clone();

    if run.status == RunStatus::Executed {
        return replay_executed(&run);
    }

    if run.status == RunStatus::Failed {
        if run.payment_verified() {
            // Payment had settled; only execution failed. Revive for retry.
            run = deps
                .runs
                .revive(&reference_str)
                .await?
                .ok_or_else(|| ProxyError::Internal("run revival raced away".to_string()))?;
        } else {
            return Err(ProxyError::PaymentVerificationFailed {
                details: "Payment failed or reference expired".to_string(),
            });
        }
    }

    if run.status == RunStatus::Pending {
        let resource = deps.resource_for(&offer.slug);
        let verified = match deps.verifier.verify(&proof, offer, &resource).await {
            Ok(verified) => verified,
            Err(error) => {
                deps.runs.mark_failed(&reference_str).await?;
                return Err(ProxyError::PaymentVerificationFailed {
                    details: error.details(),
                });
            }
        };
        run = match deps
            .runs
            .update_payment_atomic(&reference_str, &verified.signature, verified.payer.as_deref())
            .await
        {
            Ok(run) => run,
            Err(StoreError::InvalidTransition(_)) => {
                // Another request advanced the row after we took the mutex;
                // its (signature, payer) is authoritative.
                deps.runs
                    .get_by_reference(&reference_str)
                    .await?
                    .ok_or_else(|| ProxyError::Internal("run vanished mid-flight".to_string()))?
            }
            Err(StoreError::SignatureInUse) => {
                deps.runs.mark_failed(&reference_str).await?;
                return Err(StoreError::SignatureInUse.into());
            }
            Err(other) => return Err(other.into()),
        };
        if run.status == RunStatus::Executed {
            return replay_executed(&run);
        }
    }

    // Offer status may have flipped while we verified; read it fresh, not
    // through the cache.
    let current = deps
        .offers
        .get_by_id(offer.id)
        .await?
        .ok_or(ProxyError::NotFound)?;
    if !current.is_active() {
        deps.runs.mark_failed(&reference_str).await?;
        return Err(ProxyError::OfferNotActive);
    }

    let mut payload = forwarded;
    payload.insert("reference".to_string(), json!(reference_str));
    payload.insert("signature".to_string(), json!(run.signature));
    payload.insert("payer".to_string(), json!(run.payer));
    let payload = JsonValue::Object(payload);

    let started = Instant::now();
    match deps.upstream.dispatch(offer, &payload).await {
        Ok(data) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            let value = data.into_value();
            let run = deps
                .runs
                .mark_executed(&reference_str, duration_ms as i64, &value)
                .await?;
            record_upstream(deps, offer.id, true).await;
            deps.offer_cache.invalidate(&offer.slug).await;

            let body = response::charge_success(
                value,
                &reference_str,
                run.signature.as_deref(),
                duration_ms,
            );
            store_response(deps, &identifier, idempotency_key.as_deref(), &body).await;
            Ok(body)
        }
        Err(error) => {
            record_upstream(deps, offer.id, false).await;
            if error.is_timeout() {
                // Payment stays valid; the run remains paid and retryable.
                return Err(ProxyError::UpstreamTimeout);
            }
            let refund = deps.refunds.refund_run(offer, &run).await;
            let retry_allowed = !refund.issued();
            if refund.issued() {
                // The payment went back to the payer; this run is spent.
                deps.runs.mark_failed(&reference_str).await?;
            }
            Err(ProxyError::UpstreamFailed {
                details: error.to_string(),
                refund,
                retry_allowed,
            })
        }
    }
}

/// The reward flow: challenge, claim cap, upstream validation, disbursement.
async fn handle_reward(
    deps: &Deps,
    offer: &Offer,
    claim: RewardClaim,
) -> Result<JsonValue, ProxyError> {
    let static_amount = offer
        .reward_amount
        .filter(|amount| *amount > 0)
        .ok_or_else(|| ProxyError::Internal("reward offer without amount".to_string()))?
        as u64;
    let max_claims = offer.max_claims_per_user.unwrap_or(1) as i64;

    deps.challenges
        .validate(offer.id, &claim.wallet, &claim.nonce, &claim.signature)
        .await?;

    offer
        .validate_inputs(&claim.forwarded)
        .map_err(ProxyError::Validation)?;

    let reference = claim.reference.unwrap_or_else(Reference::new_rand);
    let identifier = reference.to_string();
    let lock_key = format!("lock:payment:{identifier}");
    deps.mutex
        .with_lock(&lock_key, &deps.lock_options, || {
            execute_reward(
                deps,
                offer,
                claim.wallet,
                reference,
                claim.forwarded,
                static_amount,
                max_claims,
            )
        })
        .await
        .map_err(|_| ProxyError::Contention)?
}

async fn execute_reward(
    deps: &Deps,
    offer: &Offer,
    wallet: Address,
    reference: Reference,
    forwarded: request::Forwarded,
    static_amount: u64,
    max_claims: i64,
) -> Result<JsonValue, ProxyError> {
    let reference_str = reference.to_string();
    if let Some(cached) = cached_response(deps, &reference_str, None).await {
        return Ok(cached);
    }

    let wallet_str = wallet.to_string();
    let claimed = deps.claims.count_for_user(offer.id, &wallet_str).await?;
    if claimed >= max_claims {
        return Err(ProxyError::ClaimLimitReached);
    }

    let run = match deps.runs.get_by_reference(&reference_str).await? {
        Some(run) if run.status == RunStatus::Executed => return replay_executed(&run),
        Some(run) if run.status == RunStatus::Pending => run,
        Some(_) => {
            return Err(ProxyError::Validation(
                "Reference already used by a finished run".to_string(),
            ));
        }
        None => {
            deps.runs
                .create_run(offer.id, &reference_str, JsonValue::Object(forwarded.clone()))
                .await?
        }
    };

    // Ask the upstream to validate the claimed action.
    let mut payload = forwarded;
    payload.insert("reference".to_string(), json!(reference_str));
    payload.insert("wallet".to_string(), json!(wallet_str));
    let payload = JsonValue::Object(payload);

    let started = Instant::now();
    let data = match deps.upstream.dispatch(offer, &payload).await {
        Ok(data) => data,
        Err(error) => {
            record_upstream(deps, offer.id, false).await;
            deps.runs.mark_failed(&reference_str).await?;
            if error.is_timeout() {
                return Err(ProxyError::UpstreamTimeout);
            }
            return Err(ProxyError::UpstreamFailed {
                details: error.to_string(),
                refund: RefundOutcome::NotApplicable,
                retry_allowed: false,
            });
        }
    };

    let effective_amount = data.dynamic_reward_amount().unwrap_or(static_amount);
    let value = data.into_value();

    let signature = match deps
        .reward
        .disburse(offer, &wallet, &reference, effective_amount)
        .await
    {
        Ok(signature) => signature,
        Err(error) => {
            record_upstream(deps, offer.id, false).await;
            deps.runs.mark_failed(&reference_str).await?;
            return Err(ProxyError::Internal(format!("reward disbursement: {error}")));
        }
    };

    deps.runs
        .update_payment_atomic(&reference_str, &signature, Some(&wallet_str))
        .await?;
    if let Err(error) = deps
        .claims
        .insert(offer.id, &wallet_str, &reference_str, &signature)
        .await
    {
        // The transfer is already broadcast; a duplicate claim row here
        // means a racing claim won the nonce gate and this one must not
        // have reached disbursement. Surface loudly.
        tracing::error!(offer = %offer.slug, wallet = %wallet.truncated(), %error, "Claim row insert failed after disbursement");
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    deps.runs
        .mark_executed(&reference_str, duration_ms as i64, &value)
        .await?;
    record_upstream(deps, offer.id, true).await;
    deps.offer_cache.invalidate(&offer.slug).await;

    let body = response::reward_success(
        value,
        &reference_str,
        effective_amount,
        &signature,
        duration_ms,
    );
    store_response(deps, &reference_str, None, &body).await;
    Ok(body)
}

/// Serves an already-executed run from the response recorded on the run
/// row. Reached only when the idempotent cache (checked first, 24 h TTL)
/// has already expired.
fn replay_executed(run: &Run) -> Result<JsonValue, ProxyError> {
    let recorded = run.recorded_response().cloned().ok_or_else(|| {
        ProxyError::Internal("executed run has no recorded response".to_string())
    })?;
    Ok(response::charge_success(
        recorded,
        &run.reference,
        run.signature.as_deref(),
        run.duration_ms.unwrap_or(0) as u64,
    ))
}

async fn cached_response(
    deps: &Deps,
    identifier: &str,
    idempotency_key: Option<&str>,
) -> Option<JsonValue> {
    if let Some(hit) = deps.responses.get(identifier).await {
        return Some(hit);
    }
    if let Some(key) = idempotency_key {
        return deps.responses.get(key).await;
    }
    None
}

async fn store_response(
    deps: &Deps,
    identifier: &str,
    idempotency_key: Option<&str>,
    body: &JsonValue,
) {
    deps.responses.put(identifier, body).await;
    if let Some(key) = idempotency_key {
        deps.responses.put(key, body).await;
    }
}

/// Breaker accounting: in-process counters plus the persisted columns.
async fn record_upstream(deps: &Deps, offer_id: Uuid, success: bool) {
    deps.upstream.breaker().record(offer_id, success);
    if let Err(error) = deps.offers.record_upstream_result(offer_id, success).await {
        tracing::warn!(%offer_id, %error, "Could not persist upstream result");
    }
}
