//! Automatic refunds when payment succeeded but upstream execution failed,
//! and the creator-debt ledger that accompanies them.
//!
//! A refund is attempted only when the run has both a settled signature and
//! a known payer. The transfer goes from the platform refund wallet back to
//! the payer for the full price, carries the original run reference as a
//! read-only key, and is confirmed before the refund row flips to `issued`
//! with its paired creator-debt row.

use serde_json::Value as JsonValue;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_signer::Signer;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::{Address, ChainProvider, Reference};
use crate::store::{Offer, RefundStore, Run};

/// What happened to the refund, as reported in 500 bodies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefundOutcome {
    Issued { signature: String },
    Failed { message: String },
    NotApplicable,
}

impl RefundOutcome {
    pub fn issued(&self) -> bool {
        matches!(self, RefundOutcome::Issued { .. })
    }

    /// The `refund` block of an error response.
    pub fn to_body(&self) -> JsonValue {
        match self {
            RefundOutcome::Issued { signature } => serde_json::json!({
                "issued": true,
                "status": "issued",
                "signature": signature,
            }),
            RefundOutcome::Failed { message } => serde_json::json!({
                "issued": false,
                "status": "failed",
                "message": message,
            }),
            RefundOutcome::NotApplicable => serde_json::json!({
                "issued": false,
                "status": "not-applicable",
                "message": "not-applicable",
            }),
        }
    }
}

pub struct RefundManager {
    chain: Arc<ChainProvider>,
    refund_keypair: Arc<Keypair>,
    refunds: RefundStore,
}

impl RefundManager {
    pub fn new(chain: Arc<ChainProvider>, refund_keypair: Arc<Keypair>, refunds: RefundStore) -> Self {
        Self {
            chain,
            refund_keypair,
            refunds,
        }
    }

    pub fn refund_address(&self) -> Address {
        Address::new(self.refund_keypair.pubkey())
    }

    /// Refunds the run's payer for the offer's full price.
    ///
    /// Never returns an error: every failure mode collapses into a
    /// [`RefundOutcome`] so the caller can report it inside the 500 body it
    /// is already building.
    pub async fn refund_run(&self, offer: &Offer, run: &Run) -> RefundOutcome {
        let (Some(_signature), Some(payer)) = (&run.signature, &run.payer) else {
            return RefundOutcome::NotApplicable;
        };
        let payer = match Address::from_str(payer) {
            Ok(address) => address,
            Err(error) => {
                tracing::error!(run = %run.reference, %error, "Refund target unparseable");
                return RefundOutcome::Failed { message: error };
            }
        };

        let refund = match self.refunds.create_pending(run.id, offer.price).await {
            Ok(refund) => refund,
            Err(error) => {
                tracing::error!(run = %run.reference, %error, "Could not create refund row");
                return RefundOutcome::Failed {
                    message: "refund could not be recorded".to_string(),
                };
            }
        };

        let memo = format!("blink402 refund: {}", offer.slug);
        let reference = Reference::from_str(&run.reference).ok();
        let broadcast = async {
            let tx = self
                .chain
                .build_transfer(
                    &self.refund_keypair,
                    payer.pubkey(),
                    &offer.payment_token,
                    offer.price.max(0) as u64,
                    &memo,
                    reference.as_ref(),
                )
                .await?;
            self.chain
                .send_and_confirm(&tx, CommitmentConfig::confirmed())
                .await
        }
        .await;

        match broadcast {
            Ok(signature) => {
                let signature = signature.to_string();
                if let Err(error) = self
                    .refunds
                    .mark_issued(refund.id, &signature, offer.creator_id, offer.id, offer.price)
                    .await
                {
                    // The transfer is on-chain; the ledger write failing is
                    // an operational incident, not a refund failure.
                    tracing::error!(
                        refund = %refund.id,
                        %signature,
                        %error,
                        "Refund issued but ledger update failed"
                    );
                }
                tracing::info!(
                    offer = %offer.slug,
                    run = %run.reference,
                    %signature,
                    "Refund issued"
                );
                RefundOutcome::Issued { signature }
            }
            Err(error) => {
                tracing::error!(offer = %offer.slug, run = %run.reference, %error, "Refund failed");
                if let Err(store_error) = self.refunds.mark_failed(refund.id).await {
                    tracing::error!(refund = %refund.id, %store_error, "Could not mark refund failed");
                }
                RefundOutcome::Failed {
                    message: error.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_body_shape() {
        let outcome = RefundOutcome::Issued {
            signature: "5sig".into(),
        };
        assert!(outcome.issued());
        assert_eq!(
            outcome.to_body(),
            serde_json::json!({"issued": true, "status": "issued", "signature": "5sig"})
        );
    }

    #[test]
    fn failed_body_shape() {
        let outcome = RefundOutcome::Failed {
            message: "broadcast failed".into(),
        };
        assert!(!outcome.issued());
        assert_eq!(
            outcome.to_body(),
            serde_json::json!({"issued": false, "status": "failed", "message": "broadcast failed"})
        );
    }

    #[test]
    fn not_applicable_body_shape() {
        let outcome = RefundOutcome::NotApplicable;
        assert_eq!(
            outcome.to_body(),
            serde_json::json!({
                "issued": false,
                "status": "not-applicable",
                "message": "not-applicable",
            })
        );
    }
}
