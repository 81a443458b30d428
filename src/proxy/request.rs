//! Typed request model for the priced-call endpoint.
//!
//! The body of `POST /<slug>` is not an arbitrary bag: it is one of four
//! shapes, discriminated by header and field presence, with every
//! non-reserved scalar routed into a forwarded-payload map that travels to
//! the upstream untouched.

use axum::http::HeaderMap;
use serde_json::{Map, Value as JsonValue};

use crate::chain::{Address, Reference};
use crate::error::ProxyError;
use crate::payment::PaymentEnvelope;

/// Header carrying a facilitator payment envelope.
pub const PAYMENT_HEADER: &str = "x-payment";
/// Header carrying a settled transaction hash.
pub const PAYMENT_TX_HEADER: &str = "x-payment-tx";

const IDEMPOTENCY_HEADERS: [&str; 2] = ["idempotency-key", "x-idempotency-key"];

/// Body keys consumed by the proxy itself and never forwarded.
const RESERVED_KEYS: [&str; 6] = [
    "reference",
    "signature",
    "paymentTx",
    "wallet",
    "_challengeNonce",
    "_challengeSignature",
];

/// Scalar inputs forwarded to the upstream.
pub type Forwarded = Map<String, JsonValue>;

/// A priced call with no payment proof yet. With a reference attached it
/// asks for on-chain verification of a payment made out-of-band; without
/// one it is answered with 402 payment requirements.
#[derive(Debug)]
pub struct ChargeInit {
    pub reference: Option<Reference>,
    pub forwarded: Forwarded,
    pub wallet_hint: Option<Address>,
    pub idempotency_key: Option<String>,
}

/// A priced call carrying a facilitator envelope in `X-Payment`.
#[derive(Debug)]
pub struct ChargeWithEnvelope {
    pub envelope: PaymentEnvelope,
    pub reference: Option<Reference>,
    pub forwarded: Forwarded,
    pub idempotency_key: Option<String>,
}

/// A priced call trusting an already-settled transaction hash.
#[derive(Debug)]
pub struct ChargeWithTxHash {
    pub tx_hash: String,
    pub reference: Option<Reference>,
    pub forwarded: Forwarded,
    pub wallet_hint: Option<Address>,
    pub idempotency_key: Option<String>,
}

/// A reward claim carrying a signed challenge.
#[derive(Debug)]
pub struct RewardClaim {
    pub wallet: Address,
    pub nonce: String,
    pub signature: String,
    pub reference: Option<Reference>,
    pub forwarded: Forwarded,
}

#[derive(Debug)]
pub enum ProxyRequest {
    ChargeInit(ChargeInit),
    ChargeWithEnvelope(ChargeWithEnvelope),
    ChargeWithTxHash(ChargeWithTxHash),
    RewardClaim(RewardClaim),
}

impl ProxyRequest {
    /// Discriminates the request shape from headers and body fields.
    ///
    /// Precedence: challenge fields make a reward claim; then the payment
    /// envelope header; then a tx hash (header or body); then a bare
    /// reference; a body with none of these is a charge initiation.
    pub fn from_parts(headers: &HeaderMap, body: &JsonValue) -> Result<Self, ProxyError> {
        let empty = Map::new();
        let fields = body.as_object().unwrap_or(&empty);

        let reference = fields
            .get("reference")
            .and_then(JsonValue::as_str)
            .map(|raw| raw.parse::<Reference>().map_err(ProxyError::Validation))
            .transpose()?;
        let forwarded = extract_forwarded(fields);
        let idempotency_key = idempotency_key(headers);
        let wallet_hint = fields
            .get("wallet")
            .and_then(JsonValue::as_str)
            .and_then(|raw| raw.parse::<Address>().ok());

        let nonce = fields.get("_challengeNonce").and_then(JsonValue::as_str);
        let challenge_signature = fields
            .get("_challengeSignature")
            .and_then(JsonValue::as_str);
        if let (Some(nonce), Some(signature)) = (nonce, challenge_signature) {
            let wallet = fields
                .get("wallet")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| {
                    ProxyError::Validation("Reward claims require a wallet field".to_string())
                })?
                .parse::<Address>()
                .map_err(ProxyError::Validation)?;
            return Ok(ProxyRequest::RewardClaim(RewardClaim {
                wallet,
                nonce: nonce.to_string(),
                signature: signature.to_string(),
                reference,
                forwarded,
            }));
        }

        if let Some(raw) = header_value(headers, PAYMENT_HEADER) {
            let envelope = PaymentEnvelope::from_header(&raw)
                .map_err(|e| ProxyError::Validation(e.to_string()))?;
            return Ok(ProxyRequest::ChargeWithEnvelope(ChargeWithEnvelope {
                envelope,
                reference,
                forwarded,
                idempotency_key,
            }));
        }

        let tx_hash = header_value(headers, PAYMENT_TX_HEADER)
            .or_else(|| {
                fields
                    .get("paymentTx")
                    .and_then(JsonValue::as_str)
                    .map(String::from)
            })
            .or_else(|| {
                fields
                    .get("signature")
                    .and_then(JsonValue::as_str)
                    .map(String::from)
            });
        if let Some(tx_hash) = tx_hash {
            return Ok(ProxyRequest::ChargeWithTxHash(ChargeWithTxHash {
                tx_hash,
                reference,
                forwarded,
                wallet_hint,
                idempotency_key,
            }));
        }

        Ok(ProxyRequest::ChargeInit(ChargeInit {
            reference,
            forwarded,
            wallet_hint,
            idempotency_key,
        }))
    }

    /// The wallet used for rate-limit accounting, when one is identifiable
    /// before verification.
    pub fn rate_limit_wallet(&self) -> Option<Address> {
        match self {
            ProxyRequest::RewardClaim(claim) => Some(claim.wallet),
            ProxyRequest::ChargeWithEnvelope(charge) => {
                charge.envelope.transfer_authority().ok()
            }
            ProxyRequest::ChargeWithTxHash(charge) => charge.wallet_hint,
            ProxyRequest::ChargeInit(init) => init.wallet_hint,
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    IDEMPOTENCY_HEADERS
        .iter()
        .find_map(|name| header_value(headers, name))
}

/// Collects forwardable inputs: every non-reserved top-level scalar, plus
/// the scalars of a nested `data` object.
fn extract_forwarded(fields: &Map<String, JsonValue>) -> Forwarded {
    let mut forwarded = Map::new();
    for (key, value) in fields {
        if RESERVED_KEYS.contains(&key.as_str()) || key == "data" {
            continue;
        }
        if is_scalar(value) {
            forwarded.insert(key.clone(), value.clone());
        }
    }
    if let Some(data) = fields.get("data").and_then(JsonValue::as_object) {
        for (key, value) in data {
            if is_scalar(value) {
                forwarded.insert(key.clone(), value.clone());
            }
        }
    }
    forwarded
}

fn is_scalar(value: &JsonValue) -> bool {
    matches!(
        value,
        JsonValue::String(_) | JsonValue::Number(_) | JsonValue::Bool(_)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde_json::json;

    const WALLET: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZ5nc4pb";
    const REFERENCE: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn envelope_header() -> HeaderValue {
        let wire = json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "solana",
            "payload": { "transaction": "" },
        });
        HeaderValue::from_str(&BASE64.encode(serde_json::to_vec(&wire).unwrap())).unwrap()
    }

    #[test]
    fn bare_body_is_charge_init() {
        let request =
            ProxyRequest::from_parts(&HeaderMap::new(), &json!({"a": 1, "b": 2})).unwrap();
        match request {
            ProxyRequest::ChargeInit(init) => {
                assert!(init.reference.is_none());
                assert_eq!(init.forwarded.len(), 2);
            }
            other => panic!("expected ChargeInit, got {other:?}"),
        }
    }

    #[test]
    fn reference_only_is_charge_init_with_reference() {
        let request =
            ProxyRequest::from_parts(&HeaderMap::new(), &json!({"reference": REFERENCE})).unwrap();
        match request {
            ProxyRequest::ChargeInit(init) => assert!(init.reference.is_some()),
            other => panic!("expected ChargeInit, got {other:?}"),
        }
    }

    #[test]
    fn envelope_header_wins_over_body_signature() {
        let mut headers = HeaderMap::new();
        headers.insert("x-payment", envelope_header());
        let body = json!({"signature": "5".repeat(87), "reference": REFERENCE});
        let request = ProxyRequest::from_parts(&headers, &body).unwrap();
        assert!(matches!(request, ProxyRequest::ChargeWithEnvelope(_)));
    }

    #[test]
    fn tx_hash_from_header_or_body() {
        let mut headers = HeaderMap::new();
        headers.insert("x-payment-tx", HeaderValue::from_static("somehash"));
        let request = ProxyRequest::from_parts(&headers, &json!({})).unwrap();
        assert!(matches!(request, ProxyRequest::ChargeWithTxHash(_)));

        let request =
            ProxyRequest::from_parts(&HeaderMap::new(), &json!({"paymentTx": "hash"})).unwrap();
        assert!(matches!(request, ProxyRequest::ChargeWithTxHash(_)));
    }

    #[test]
    fn challenge_fields_make_a_reward_claim() {
        let body = json!({
            "wallet": WALLET,
            "_challengeNonce": "abc",
            "_challengeSignature": "sig",
            "questId": "q-1",
        });
        let request = ProxyRequest::from_parts(&HeaderMap::new(), &body).unwrap();
        match request {
            ProxyRequest::RewardClaim(claim) => {
                assert_eq!(claim.wallet.to_string(), WALLET);
                assert_eq!(claim.nonce, "abc");
                assert_eq!(claim.forwarded.get("questId"), Some(&json!("q-1")));
            }
            other => panic!("expected RewardClaim, got {other:?}"),
        }
    }

    #[test]
    fn reward_claim_without_wallet_is_rejected() {
        let body = json!({"_challengeNonce": "abc", "_challengeSignature": "sig"});
        assert!(matches!(
            ProxyRequest::from_parts(&HeaderMap::new(), &body),
            Err(ProxyError::Validation(_))
        ));
    }

    #[test]
    fn invalid_reference_is_rejected() {
        let body = json!({"reference": "!!not-base58!!"});
        assert!(matches!(
            ProxyRequest::from_parts(&HeaderMap::new(), &body),
            Err(ProxyError::Validation(_))
        ));
    }

    #[test]
    fn forwarded_strips_reserved_keys_and_objects() {
        let body = json!({
            "reference": REFERENCE,
            "wallet": WALLET,
            "city": "Lisbon",
            "nested": {"drop": "me"},
            "data": {"days": 3, "deep": {"drop": true}},
        });
        let request = ProxyRequest::from_parts(&HeaderMap::new(), &body).unwrap();
        let forwarded = match request {
            ProxyRequest::ChargeInit(init) => init.forwarded,
            other => panic!("expected ChargeInit, got {other:?}"),
        };
        assert_eq!(forwarded.get("city"), Some(&json!("Lisbon")));
        assert_eq!(forwarded.get("days"), Some(&json!(3)));
        assert!(!forwarded.contains_key("wallet"));
        assert!(!forwarded.contains_key("reference"));
        assert!(!forwarded.contains_key("nested"));
        assert!(!forwarded.contains_key("deep"));
    }

    #[test]
    fn idempotency_key_from_either_header() {
        let mut headers = HeaderMap::new();
        headers.insert("idempotency-key", HeaderValue::from_static("k1"));
        let request = ProxyRequest::from_parts(&headers, &json!({})).unwrap();
        match request {
            ProxyRequest::ChargeInit(init) => {
                assert_eq!(init.idempotency_key.as_deref(), Some("k1"))
            }
            other => panic!("expected ChargeInit, got {other:?}"),
        }

        let mut headers = HeaderMap::new();
        headers.insert("x-idempotency-key", HeaderValue::from_static("k2"));
        let request = ProxyRequest::from_parts(&headers, &json!({})).unwrap();
        match request {
            ProxyRequest::ChargeInit(init) => {
                assert_eq!(init.idempotency_key.as_deref(), Some("k2"))
            }
            other => panic!("expected ChargeInit, got {other:?}"),
        }
    }
}
