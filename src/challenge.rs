//! Single-use signed challenges for reward claims.
//!
//! A claimant first fetches a challenge bound to its wallet and the offer.
//! The canonical challenge string embeds wallet, offer id, nonce, and
//! timestamp; the client signs it with its wallet key and submits nonce and
//! signature with the claim. The server re-generates the canonical string
//! from the stored record, never from client input, verifies the ed25519
//! signature, and burns the nonce so a signature can be honored at most
//! once.

use solana_signature::Signature;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chain::Address;
use crate::kv::challenge::CHALLENGE_TTL_SECS;
use crate::kv::{ChallengeRecord, ChallengeStore, KvError};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ChallengeError {
    #[error("challenge already used")]
    Replayed,
    #[error("Challenge not found or expired")]
    Missing,
    #[error("Challenge does not match the caller")]
    Mismatch,
    #[error("Challenge has expired")]
    Expired,
    #[error("Invalid challenge signature")]
    BadSignature,
    #[error(transparent)]
    Store(#[from] KvError),
}

/// What `GET /<slug>/challenge` returns.
#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedChallenge {
    pub challenge: String,
    pub nonce: String,
    pub timestamp: u64,
    pub expires_at: u64,
}

#[derive(Clone)]
pub struct ChallengeService {
    store: ChallengeStore,
}

impl ChallengeService {
    pub fn new(store: ChallengeStore) -> Self {
        Self { store }
    }

    /// Issues a fresh challenge for `wallet` against `offer_id`.
    pub async fn issue(
        &self,
        wallet: &Address,
        offer_id: Uuid,
    ) -> Result<IssuedChallenge, ChallengeError> {
        let nonce = fresh_nonce();
        let timestamp = unix_now();
        let record = ChallengeRecord {
            wallet: wallet.to_string(),
            offer_id,
            issued_at: timestamp,
        };
        self.store.put(&nonce, &record).await?;
        Ok(IssuedChallenge {
            challenge: canonical_string(&record.wallet, offer_id, &nonce, timestamp),
            nonce,
            timestamp,
            expires_at: timestamp + CHALLENGE_TTL_SECS,
        })
    }

    /// Validates a claim's nonce and signature, then burns the nonce.
    ///
    /// Order matters: replay is checked first (before any other rejection
    /// can leak whether a nonce exists), and the nonce is inserted into the
    /// used set only after the signature verified, atomically enough that
    /// two racing claims cannot both pass; the `SET NX` insert decides the
    /// winner.
    pub async fn validate(
        &self,
        offer_id: Uuid,
        wallet: &Address,
        nonce: &str,
        signature: &str,
    ) -> Result<(), ChallengeError> {
        if self.store.is_used(nonce).await? {
            return Err(ChallengeError::Replayed);
        }
        let record = self
            .store
            .get(nonce)
            .await?
            .ok_or(ChallengeError::Missing)?;
        if record.wallet != wallet.to_string() || record.offer_id != offer_id {
            return Err(ChallengeError::Mismatch);
        }
        if is_expired(record.issued_at, unix_now()) {
            return Err(ChallengeError::Expired);
        }

        let message = canonical_string(&record.wallet, record.offer_id, nonce, record.issued_at);
        verify_signature(wallet, &message, signature)?;

        if !self.store.mark_used(nonce).await? {
            return Err(ChallengeError::Replayed);
        }
        Ok(())
    }
}

/// The string the claimant signs. Regenerated server-side for verification.
pub fn canonical_string(wallet: &str, offer_id: Uuid, nonce: &str, timestamp: u64) -> String {
    format!(
        "blink402 reward claim\nwallet: {wallet}\noffer: {offer_id}\nnonce: {nonce}\nissued: {timestamp}"
    )
}

fn verify_signature(wallet: &Address, message: &str, signature: &str) -> Result<(), ChallengeError> {
    let signature = Signature::from_str(signature).map_err(|_| ChallengeError::BadSignature)?;
    if signature.verify(wallet.as_ref(), message.as_bytes()) {
        Ok(())
    } else {
        Err(ChallengeError::BadSignature)
    }
}

/// A challenge exactly at the TTL boundary is still honored; one second past
/// it is not.
fn is_expired(issued_at: u64, now: u64) -> bool {
    now.saturating_sub(issued_at) > CHALLENGE_TTL_SECS
}

fn fresh_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_keypair::Keypair;
    use solana_signer::Signer;

    #[test]
    fn canonical_string_embeds_all_fields() {
        let offer_id = Uuid::new_v4();
        let s = canonical_string("WALLET", offer_id, "NONCE", 1_750_000_000);
        assert!(s.contains("WALLET"));
        assert!(s.contains(&offer_id.to_string()));
        assert!(s.contains("NONCE"));
        assert!(s.contains("1750000000"));
    }

    #[test]
    fn nonce_is_256_bits_of_hex() {
        let nonce = fresh_nonce();
        assert_eq!(nonce.len(), 64);
        assert_ne!(nonce, fresh_nonce());
    }

    #[test]
    fn expiry_boundary_is_inclusive() {
        let issued = 1_000_000;
        assert!(!is_expired(issued, issued + CHALLENGE_TTL_SECS));
        assert!(is_expired(issued, issued + CHALLENGE_TTL_SECS + 1));
    }

    #[test]
    fn wallet_signature_round_trips() {
        let keypair = Keypair::new();
        let wallet = Address::new(keypair.pubkey());
        let message = canonical_string(&wallet.to_string(), Uuid::new_v4(), "nonce", 42);
        let signature = keypair.sign_message(message.as_bytes());

        assert!(verify_signature(&wallet, &message, &signature.to_string()).is_ok());

        // A different wallet or a tampered message must fail.
        let other = Keypair::new();
        let other_wallet = Address::new(other.pubkey());
        assert!(matches!(
            verify_signature(&other_wallet, &message, &signature.to_string()),
            Err(ChallengeError::BadSignature)
        ));
        assert!(matches!(
            verify_signature(&wallet, "tampered", &signature.to_string()),
            Err(ChallengeError::BadSignature)
        ));
        assert!(matches!(
            verify_signature(&wallet, &message, "not-a-signature"),
            Err(ChallengeError::BadSignature)
        ));
    }
}
