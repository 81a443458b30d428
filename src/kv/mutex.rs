//! Distributed mutex keyed by payment identifier.
//!
//! Acquisition is a conditional `SET NX PX` carrying a fresh 128-bit holder
//! token; release is a compare-and-delete on that token. Contenders retry a
//! bounded number of times with a fixed delay plus a small jitter so queued
//! waiters do not stampede the store in lockstep. When the store itself is
//! unreachable the mutex degrades to best-effort: the task runs without a
//! lease and the database constraints prevent double-spend.

use std::future::Future;
use std::time::Duration;

use crate::kv::Kv;

/// The caller lost the acquisition race for the full retry budget.
#[derive(Debug, thiserror::Error)]
#[error("Lock contended: {key}")]
pub struct LockContended {
    pub key: String,
}

#[derive(Clone, Copy, Debug)]
pub struct LockOptions {
    pub ttl: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl LockOptions {
    /// Defaults used for payment processing: 15 s lease, five retries of
    /// 200 ms each (≈1 s worst-case wait before surfacing contention).
    pub fn payment() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            max_retries: 5,
            retry_delay: Duration::from_millis(200),
        }
    }
}

#[derive(Clone)]
pub struct MutexService {
    kv: Kv,
}

impl MutexService {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Runs `task` while holding the lease on `key`.
    ///
    /// The lease outlives a crashed holder only until its TTL; release is
    /// token-checked so a holder that overran its TTL cannot delete a
    /// successor's lease.
    pub async fn with_lock<T, F, Fut>(
        &self,
        key: &str,
        options: &LockOptions,
        task: F,
    ) -> Result<T, LockContended>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let token = fresh_token();
        match self.acquire(key, &token, options).await {
            Acquisition::Contended => Err(LockContended {
                key: key.to_string(),
            }),
            Acquisition::Degraded => Ok(task().await),
            Acquisition::Acquired => {
                let result = task().await;
                match self.kv.compare_and_delete(key, &token).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(key, "Lease expired before release");
                    }
                    Err(error) => {
                        tracing::warn!(key, %error, "Failed to release lease; it will expire by TTL");
                    }
                }
                Ok(result)
            }
        }
    }

    async fn acquire(&self, key: &str, token: &str, options: &LockOptions) -> Acquisition {
        let ttl_ms = options.ttl.as_millis() as u64;
        for attempt in 0..=options.max_retries {
            match self.kv.set_nx_px(key, token, ttl_ms).await {
                Ok(true) => return Acquisition::Acquired,
                Ok(false) => {
                    if attempt == options.max_retries {
                        return Acquisition::Contended;
                    }
                    tokio::time::sleep(queue_delay(options.retry_delay)).await;
                }
                Err(error) => {
                    // Store outage: run without a lease rather than fail the
                    // request; uniqueness constraints still hold downstream.
                    tracing::warn!(key, %error, "Mutex store unreachable, proceeding without lease");
                    return Acquisition::Degraded;
                }
            }
        }
        Acquisition::Contended
    }
}

enum Acquisition {
    Acquired,
    Degraded,
    Contended,
}

fn fresh_token() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Fixed delay with up to 25% jitter to spread queued contenders.
fn queue_delay(base: Duration) -> Duration {
    let jitter = rand::random::<f64>() * 0.25;
    base + base.mul_f64(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_defaults_bound_the_wait() {
        let options = LockOptions::payment();
        let worst_case = options.retry_delay.mul_f64(1.25) * options.max_retries;
        assert!(worst_case <= Duration::from_millis(1_250));
        assert_eq!(options.ttl, Duration::from_secs(15));
    }

    #[test]
    fn tokens_are_unique_and_sized() {
        let a = fresh_token();
        let b = fresh_token();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn queue_delay_stays_within_jitter_band() {
        let base = Duration::from_millis(200);
        for _ in 0..32 {
            let delay = queue_delay(base);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.25));
        }
    }
}
