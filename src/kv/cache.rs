//! Idempotent response cache and the offer read-through cache.
//!
//! Both are plain TTL caches over the key-value store; keys and values are
//! opaque here. Cache failures are never surfaced; a miss is always an
//! acceptable answer.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;

use crate::kv::Kv;

/// TTL for cached successful responses: 24 hours.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// TTL for offer lookups: 5 minutes.
pub const OFFER_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

fn idem_key(key: &str) -> String {
    format!("idem:{key}")
}

fn offer_key(slug: &str) -> String {
    format!("offer:{slug}")
}

/// Cache of successful execution responses, keyed by payment identifier and
/// by client idempotency key.
#[derive(Clone)]
pub struct ResponseCache {
    kv: Kv,
}

impl ResponseCache {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        match self.kv.get_string(&idem_key(key)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(error) => {
                tracing::debug!(key, %error, "Idempotency cache read failed");
                None
            }
        }
    }

    pub async fn put(&self, key: &str, value: &JsonValue) {
        let raw = value.to_string();
        if let Err(error) = self
            .kv
            .set_ex(&idem_key(key), &raw, IDEMPOTENCY_TTL.as_secs())
            .await
        {
            tracing::warn!(key, %error, "Idempotency cache write failed");
        }
    }
}

/// Read-through cache for offer lookups.
#[derive(Clone)]
pub struct OfferCache {
    kv: Kv,
}

impl OfferCache {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Returns the cached value for `slug`, or runs `fetch` and caches a
    /// `Some` result. Cache errors fall through to the fetch.
    pub async fn get_or_fetch<T, E, F, Fut>(&self, slug: &str, fetch: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        let key = offer_key(slug);
        if let Ok(Some(raw)) = self.kv.get_string(&key).await {
            if let Ok(cached) = serde_json::from_str::<T>(&raw) {
                return Ok(Some(cached));
            }
        }
        let fetched = fetch().await?;
        if let Some(value) = &fetched {
            if let Ok(raw) = serde_json::to_string(value) {
                if let Err(error) = self.kv.set_ex(&key, &raw, OFFER_CACHE_TTL.as_secs()).await {
                    tracing::debug!(slug, %error, "Offer cache write failed");
                }
            }
        }
        Ok(fetched)
    }

    /// Drops the cached entry; called after a successful execution so the
    /// next lookup observes fresh counters.
    pub async fn invalidate(&self, slug: &str) {
        if let Err(error) = self.kv.del(&offer_key(slug)).await {
            tracing::debug!(slug, %error, "Offer cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_namespaces_do_not_collide() {
        assert_eq!(idem_key("abc"), "idem:abc");
        assert_eq!(offer_key("abc"), "offer:abc");
        assert_ne!(idem_key("x"), offer_key("x"));
    }

    #[test]
    fn ttls_match_contract() {
        assert_eq!(IDEMPOTENCY_TTL.as_secs(), 86_400);
        assert_eq!(OFFER_CACHE_TTL.as_secs(), 300);
    }
}
