//! Named retry policies for remote calls.
//!
//! Every outbound dependency call carries one of these policies: a timeout,
//! a bounded retry count, an exponential backoff base, and a caller-supplied
//! classifier deciding which errors are worth retrying.

use std::future::Future;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub name: &'static str,
    /// Per-attempt deadline. Enforced by the transport making the call
    /// (request timeout, RPC deadline), not by [`RetryPolicy::run`].
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    /// Facilitator verify/settle calls: short timeout, one retry.
    pub fn facilitator_verify() -> Self {
        Self {
            name: "facilitator_verify",
            timeout: Duration::from_secs(10),
            max_retries: 1,
            backoff_base: Duration::from_millis(250),
        }
    }

    /// Upstream dispatch: the 30 s deadline is the whole budget, no retry.
    pub fn upstream_dispatch() -> Self {
        Self {
            name: "upstream_dispatch",
            timeout: Duration::from_secs(30),
            max_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    /// Reward broadcast: retried because send failures are usually blockhash
    /// or transport transients.
    pub fn broadcast_reward() -> Self {
        Self {
            name: "broadcast_reward",
            timeout: Duration::from_secs(15),
            max_retries: 3,
            backoff_base: Duration::from_millis(500),
        }
    }

    /// On-chain reference lookups: generous retries to ride out propagation
    /// lag between broadcast and indexer visibility.
    pub fn onchain_lookup() -> Self {
        Self {
            name: "onchain_lookup",
            timeout: Duration::from_secs(10),
            max_retries: 4,
            backoff_base: Duration::from_millis(400),
        }
    }

    /// Delay before retry `attempt` (0-based): `backoff_base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Runs `op`, retrying on errors the classifier marks transient.
    pub async fn run<T, E, F, Fut>(
        &self,
        retryable: impl Fn(&E) -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_retries || !retryable(&error) {
                        return Err(error);
                    }
                    let delay = self.backoff(attempt);
                    tracing::debug!(
                        policy = self.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "Retrying after transient error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
