//! Reward disbursement: builds, signs, and broadcasts the outbound token
//! transfer from an offer's funded wallet to a validated claimant.
//!
//! Broadcast success is sufficient: the proxy does not wait for
//! confirmation, which keeps reward latency at one RPC round-trip. The
//! funded keypair is loaded once at startup; before every disbursement its
//! address is asserted against the offer's configured funded wallet so a
//! mis-deployed secret can never pay out of the wrong account.

use solana_keypair::Keypair;
use solana_signer::Signer;
use std::sync::Arc;

use crate::chain::{Address, ChainError, ChainProvider, Reference};
use crate::retry::RetryPolicy;
use crate::store::Offer;

#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    #[error("Funded wallet key mismatch: offer expects {expected}")]
    FundedWalletMismatch { expected: String },
    #[error("Offer is missing reward configuration")]
    MissingRewardConfig,
    #[error(transparent)]
    Chain(#[from] ChainError),
}

pub struct RewardDisburser {
    chain: Arc<ChainProvider>,
    funded: Arc<Keypair>,
}

impl RewardDisburser {
    pub fn new(chain: Arc<ChainProvider>, funded: Arc<Keypair>) -> Self {
        Self { chain, funded }
    }

    pub fn funded_address(&self) -> Address {
        Address::new(self.funded.pubkey())
    }

    /// Transfers `amount` of the offer's payment token to `user_wallet`,
    /// tagged with the run reference and a memo naming the offer. Returns
    /// the broadcast signature.
    pub async fn disburse(
        &self,
        offer: &Offer,
        user_wallet: &Address,
        reference: &Reference,
        amount: u64,
    ) -> Result<String, RewardError> {
        let funded_wallet = offer
            .funded_wallet
            .ok_or(RewardError::MissingRewardConfig)?;
        if *funded_wallet.pubkey() != self.funded.pubkey() {
            return Err(RewardError::FundedWalletMismatch {
                expected: funded_wallet.to_string(),
            });
        }

        let memo = format!("blink402 reward: {}", offer.slug);
        let tx = self
            .chain
            .build_transfer(
                &self.funded,
                user_wallet.pubkey(),
                &offer.payment_token,
                amount,
                &memo,
                Some(reference),
            )
            .await?;

        let policy = RetryPolicy::broadcast_reward();
        let signature = policy
            .run(ChainError::is_transient, || self.chain.send(&tx))
            .await?;

        tracing::info!(
            offer = %offer.slug,
            wallet = %user_wallet.truncated(),
            amount,
            signature = %signature,
            "Reward disbursed"
        );
        Ok(signature.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{PaymentToken, SolanaNetwork};
    use crate::store::{OfferMode, OfferStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn reward_offer(funded: Address) -> Offer {
        Offer {
            id: Uuid::new_v4(),
            slug: "quest".into(),
            title: "Quest".into(),
            description: None,
            upstream_url: "https://api.example.com/validate".into(),
            method: "POST".into(),
            price: 0,
            mode: OfferMode::Reward,
            status: OfferStatus::Active,
            payout_wallet: funded,
            payment_token: PaymentToken::Native,
            reward_amount: Some(5_000),
            funded_wallet: Some(funded),
            max_claims_per_user: Some(1),
            input_schema: None,
            creator_id: Uuid::new_v4(),
            run_count: 0,
            upstream_success: 0,
            upstream_failure: 0,
            consecutive_failures: 0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn rejects_mismatched_funded_wallet() {
        let chain = Arc::new(ChainProvider::new(
            "http://rpc.invalid".to_string(),
            SolanaNetwork::Devnet,
        ));
        let loaded_key = Arc::new(Keypair::new());
        let configured_wallet = Address::new(Keypair::new().pubkey());
        let disburser = RewardDisburser::new(chain, loaded_key);

        let offer = reward_offer(configured_wallet);
        let error = disburser
            .disburse(
                &offer,
                &Address::new(Keypair::new().pubkey()),
                &Reference::new_rand(),
                5_000,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, RewardError::FundedWalletMismatch { .. }));
    }

    #[tokio::test]
    async fn rejects_offer_without_reward_config() {
        let chain = Arc::new(ChainProvider::new(
            "http://rpc.invalid".to_string(),
            SolanaNetwork::Devnet,
        ));
        let key = Arc::new(Keypair::new());
        let disburser = RewardDisburser::new(chain, key.clone());

        let mut offer = reward_offer(Address::new(key.pubkey()));
        offer.funded_wallet = None;
        let error = disburser
            .disburse(
                &offer,
                &Address::new(Keypair::new().pubkey()),
                &Reference::new_rand(),
                5_000,
            )
            .await
            .unwrap_err();
        assert!(matches!(error, RewardError::MissingRewardConfig));
    }
}
