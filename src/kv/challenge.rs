//! Challenge storage for reward claims: nonce-keyed records with a 10-minute
//! TTL, plus the used-nonce set that makes every nonce single-use for an
//! hour after it is first honored.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::kv::{Kv, KvError};

/// Seconds a freshly issued challenge stays valid.
pub const CHALLENGE_TTL_SECS: u64 = 10 * 60;

/// Seconds a consumed nonce stays in the used set.
pub const USED_NONCE_TTL_SECS: u64 = 60 * 60;

fn challenge_key(nonce: &str) -> String {
    format!("challenge:{nonce}")
}

fn used_key(nonce: &str) -> String {
    format!("used_nonce:{nonce}")
}

/// What a challenge binds together: the claiming wallet, the offer, and the
/// moment of issuance.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeRecord {
    pub wallet: String,
    pub offer_id: Uuid,
    pub issued_at: u64,
}

#[derive(Clone)]
pub struct ChallengeStore {
    kv: Kv,
}

impl ChallengeStore {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub async fn put(&self, nonce: &str, record: &ChallengeRecord) -> Result<(), KvError> {
        let raw = serde_json::to_string(record).expect("challenge record serializes");
        self.kv
            .set_ex(&challenge_key(nonce), &raw, CHALLENGE_TTL_SECS)
            .await
    }

    pub async fn get(&self, nonce: &str) -> Result<Option<ChallengeRecord>, KvError> {
        let raw = self.kv.get_string(&challenge_key(nonce)).await?;
        Ok(raw.and_then(|r| serde_json::from_str(&r).ok()))
    }

    pub async fn is_used(&self, nonce: &str) -> Result<bool, KvError> {
        self.kv.exists(&used_key(nonce)).await
    }

    /// Claims the nonce for exactly one use. Returns false when another
    /// request already claimed it. This is the atomic replay gate.
    pub async fn mark_used(&self, nonce: &str) -> Result<bool, KvError> {
        self.kv
            .set_nx_ex(&used_key(nonce), "1", USED_NONCE_TTL_SECS)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let record = ChallengeRecord {
            wallet: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into(),
            offer_id: Uuid::new_v4(),
            issued_at: 1_750_000_000,
        };
        let raw = serde_json::to_string(&record).unwrap();
        let back: ChallengeRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn ttls_match_contract() {
        assert_eq!(CHALLENGE_TTL_SECS, 600);
        assert_eq!(USED_NONCE_TTL_SECS, 3_600);
    }
}
