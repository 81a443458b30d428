//! Sliding-window rate limiter, one counter per wallet with separate
//! buckets for charge and reward traffic.
//!
//! Each request records a timestamp in a sorted set; entries older than the
//! window are pruned before counting. The limiter is best-effort: if the
//! counter store is unreachable the request proceeds and the bypass is
//! logged.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::chain::Address;
use crate::kv::Kv;

/// Window length for both buckets.
pub const WINDOW_SECS: u64 = 3_600;

/// Hourly allowance for wallets calling charge offers.
pub const CHARGE_LIMIT: u32 = 10;

/// Hourly allowance for wallets claiming rewards.
pub const REWARD_LIMIT: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateBucket {
    Charge,
    Reward,
}

impl RateBucket {
    fn as_str(&self) -> &'static str {
        match self {
            RateBucket::Charge => "charge",
            RateBucket::Reward => "reward",
        }
    }
}

/// Outcome of a rate check, carrying everything the 429 headers need.
#[derive(Clone, Copy, Debug)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after_secs: u64,
}

fn decide(limit: u32, current_count: u64) -> RateDecision {
    if current_count >= limit as u64 {
        RateDecision {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_secs: WINDOW_SECS,
        }
    } else {
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - current_count as u32 - 1,
            retry_after_secs: 0,
        }
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    kv: Kv,
    charge_limit: u32,
    reward_limit: u32,
}

impl RateLimiter {
    pub fn new(kv: Kv, charge_limit: u32, reward_limit: u32) -> Self {
        Self {
            kv,
            charge_limit,
            reward_limit,
        }
    }

    /// Counts the wallet's requests inside the window and records this one
    /// when allowed.
    pub async fn check(&self, bucket: RateBucket, wallet: &Address) -> RateDecision {
        let limit = match bucket {
            RateBucket::Charge => self.charge_limit,
            RateBucket::Reward => self.reward_limit,
        };
        let key = format!("rate:{}:{}", bucket.as_str(), wallet);
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_millis() as i64;
        let window_ms = (WINDOW_SECS * 1_000) as i64;

        let result: Result<RateDecision, crate::kv::KvError> = async {
            self.kv.zrembyscore(&key, 0, now_ms - window_ms).await?;
            let count = self.kv.zcard(&key).await?;
            let decision = decide(limit, count);
            if decision.allowed {
                let member = format!("{now_ms}-{:08x}", rand::random::<u32>());
                self.kv.zadd(&key, &member, now_ms).await?;
                self.kv.expire(&key, WINDOW_SECS as i64).await?;
            }
            Ok(decision)
        }
        .await;

        match result {
            Ok(decision) => decision,
            Err(error) => {
                tracing::warn!(
                    wallet = %wallet.truncated(),
                    bucket = bucket.as_str(),
                    %error,
                    "rate_limit_bypass"
                );
                RateDecision {
                    allowed: true,
                    limit,
                    remaining: limit,
                    retry_after_secs: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_the_limit() {
        let decision = decide(10, 0);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn last_slot_leaves_zero_remaining() {
        let decision = decide(10, 9);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn eleventh_request_in_window_is_denied() {
        let decision = decide(10, 10);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_secs, 3_600);
    }

    #[test]
    fn reward_bucket_is_tighter() {
        assert!(decide(REWARD_LIMIT, 5).allowed == false);
        assert!(decide(CHARGE_LIMIT, 5).allowed);
    }
}
