//! Configuration for the proxy server.
//!
//! Everything comes from the environment (loaded through `.env` at startup)
//! or the matching CLI flags. Secrets are wrapped in [`SolanaSecretKey`],
//! which validates the standard 64-byte base58 keypair format at parse time
//! and never renders the key material in `Debug` output or `--help`.

use clap::Parser;
use solana_keypair::Keypair;
use std::fmt::{Debug, Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::chain::{Address, SolanaNetwork};
use crate::kv::LockOptions;

/// A validated Solana keypair secret (64 bytes, base58).
///
/// First 32 bytes are the ed25519 seed, last 32 the public key: the format
/// produced by the standard CLI and wallets.
#[derive(Clone, PartialEq, Eq)]
pub struct SolanaSecretKey([u8; 64]);

impl SolanaSecretKey {
    pub fn from_base58(s: &str) -> Result<Self, String> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| format!("Invalid base58: {e}"))?;
        if bytes.len() != 64 {
            return Err(format!(
                "Secret key must be 64 bytes (standard Solana keypair format), got {}",
                bytes.len()
            ));
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn keypair(&self) -> Keypair {
        Keypair::from_base58_string(&bs58::encode(&self.0).into_string())
    }
}

impl Debug for SolanaSecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("SolanaSecretKey(***)")
    }
}

impl FromStr for SolanaSecretKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_base58(s)
    }
}

impl Display for SolanaSecretKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("***")
    }
}

/// Server configuration, resolved from flags and environment.
#[derive(Parser, Debug, Clone)]
#[command(name = "blink402")]
#[command(about = "Payment-gated HTTP proxy")]
pub struct Config {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,
    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// PostgreSQL connection string for the durable store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,
    /// Redis connection string for the key-value store.
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    /// Payment network selector (`solana` or `solana-devnet`).
    #[arg(long, env = "SOLANA_NETWORK", default_value = "solana")]
    pub network: SolanaNetwork,
    #[arg(long, env = "SOLANA_RPC_URL", default_value = "https://api.mainnet-beta.solana.com")]
    pub rpc_url: Url,
    /// Platform treasury address.
    #[arg(long, env = "TREASURY_WALLET")]
    pub treasury: Address,
    /// Base URL of the payment facilitator.
    #[arg(long, env = "FACILITATOR_URL")]
    pub facilitator_url: Url,
    /// Base URL that `/`-prefixed internal upstreams resolve against.
    #[arg(long, env = "API_BASE_URL")]
    pub api_base_url: Option<Url>,
    /// Public origin of this proxy, used when naming resources to the
    /// facilitator.
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: Option<Url>,

    /// Keypair funding reward disbursements.
    #[arg(long, env = "FUNDED_WALLET_KEY", hide_env_values = true)]
    pub funded_wallet_key: SolanaSecretKey,
    /// Keypair paying refunds.
    #[arg(long, env = "REFUND_WALLET_KEY", hide_env_values = true)]
    pub refund_wallet_key: SolanaSecretKey,

    #[arg(long, env = "RATE_LIMIT_CHARGE_PER_HOUR", default_value_t = crate::kv::rate_limit::CHARGE_LIMIT)]
    pub rate_limit_charge_per_hour: u32,
    #[arg(long, env = "RATE_LIMIT_REWARD_PER_HOUR", default_value_t = crate::kv::rate_limit::REWARD_LIMIT)]
    pub rate_limit_reward_per_hour: u32,
    #[arg(long, env = "MUTEX_TTL_MS", default_value_t = 15_000)]
    pub mutex_ttl_ms: u64,
    #[arg(long, env = "MUTEX_MAX_RETRIES", default_value_t = 5)]
    pub mutex_max_retries: u32,
    #[arg(long, env = "MUTEX_RETRY_DELAY_MS", default_value_t = 200)]
    pub mutex_retry_delay_ms: u64,
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 30)]
    pub upstream_timeout_secs: u64,
    #[arg(long, env = "MAX_RESPONSE_BYTES", default_value_t = crate::upstream::MAX_RESPONSE_BYTES)]
    pub max_response_bytes: usize,
    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 10)]
    pub database_max_connections: u32,
}

impl Config {
    pub fn load() -> Self {
        Self::parse()
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            ttl: Duration::from_millis(self.mutex_ttl_ms),
            max_retries: self.mutex_max_retries,
            retry_delay: Duration::from_millis(self.mutex_retry_delay_ms),
        }
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_signer::Signer;

    #[test]
    fn secret_key_round_trips_and_redacts() {
        let keypair = Keypair::new();
        let encoded = keypair.to_base58_string();
        let secret = SolanaSecretKey::from_base58(&encoded).unwrap();
        assert_eq!(secret.keypair().pubkey(), keypair.pubkey());

        let debug = format!("{secret:?}");
        assert!(!debug.contains(&encoded));
        assert!(debug.contains("***"));
    }

    #[test]
    fn secret_key_rejects_wrong_length() {
        assert!(SolanaSecretKey::from_base58("abc").is_err());
        let short = bs58::encode([0u8; 32]).into_string();
        assert!(SolanaSecretKey::from_base58(&short).is_err());
    }
}
