//! Payment verification: three interchangeable strategies converging on one
//! `(signature, payer)` pair.
//!
//! The strategy is a sum type selected from the request shape, never
//! inferred at runtime from field sniffing:
//!
//! - [`PaymentProof::Envelope`] — a facilitator-mediated pre-signed
//!   transaction submitted in the `X-Payment` header; the facilitator
//!   verifies and settles it, and the payer is the transfer authority
//!   extracted from the envelope itself.
//! - [`PaymentProof::TxHash`] — a transaction hash the caller's
//!   counterparty already settled; trusted as-is, with a best-effort fetch
//!   to populate the payer eagerly.
//! - [`PaymentProof::OnChainReference`] — nothing but the run reference;
//!   verified by scanning the chain for a confirmed transfer carrying it.

pub mod envelope;
pub mod facilitator;
pub mod onchain;
pub mod requirements;

use solana_signature::Signature;
use std::str::FromStr;
use std::sync::Arc;

use crate::chain::{ChainProvider, Reference};
use crate::retry::RetryPolicy;
use crate::store::Offer;

pub use envelope::{EnvelopeError, PaymentEnvelope};
pub use facilitator::{
    FacilitatorClient, FacilitatorClientError, FacilitatorRequirements, VerifyRequest,
};
pub use requirements::{ExactScheme, PaymentRequirements};

/// Proof of payment as presented by the client.
#[derive(Clone, Debug)]
pub enum PaymentProof {
    Envelope(PaymentEnvelope),
    TxHash(String),
    OnChainReference(Reference),
}

/// What every strategy produces: the settled transaction signature and, when
/// derivable, the paying wallet.
#[derive(Clone, Debug)]
pub struct VerifiedPayment {
    pub signature: String,
    pub payer: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment verification failed: {0}")]
    VerificationFailed(String),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error(transparent)]
    Facilitator(#[from] FacilitatorClientError),
    #[error(transparent)]
    OnChain(#[from] onchain::OnChainError),
}

impl PaymentError {
    /// The human-readable detail carried in 402 bodies.
    pub fn details(&self) -> String {
        self.to_string()
    }
}

/// Dispatches a [`PaymentProof`] to its verification strategy.
pub struct PaymentVerifier {
    facilitator: FacilitatorClient,
    chain: Arc<ChainProvider>,
}

impl PaymentVerifier {
    pub fn new(facilitator: FacilitatorClient, chain: Arc<ChainProvider>) -> Self {
        Self { facilitator, chain }
    }

    /// Verifies the proof against the offer's terms.
    ///
    /// `resource` names the priced endpoint in facilitator requests. All
    /// strategies are side-effect free with respect to the run row; the
    /// caller writes the returned pair via the run store under the payment
    /// mutex.
    pub async fn verify(
        &self,
        proof: &PaymentProof,
        offer: &Offer,
        resource: &str,
    ) -> Result<VerifiedPayment, PaymentError> {
        match proof {
            PaymentProof::Envelope(envelope) => self.verify_envelope(envelope, offer, resource).await,
            PaymentProof::TxHash(hash) => self.verify_tx_hash(hash).await,
            PaymentProof::OnChainReference(reference) => {
                let transfer = onchain::verify_reference(
                    &self.chain,
                    reference,
                    &offer.payout_wallet,
                    &offer.payment_token,
                    offer.price.max(0) as u64,
                )
                .await?;
                Ok(VerifiedPayment {
                    signature: transfer.signature,
                    payer: transfer.payer,
                })
            }
        }
    }

    /// Strategy F: facilitator verify, then settle, then extract the payer
    /// from the envelope's transfer instruction (never the fee payer).
    async fn verify_envelope(
        &self,
        envelope: &PaymentEnvelope,
        offer: &Offer,
        resource: &str,
    ) -> Result<VerifiedPayment, PaymentError> {
        let request = VerifyRequest {
            x402_version: 1,
            payment_payload: envelope.as_payload_json(),
            payment_requirements: FacilitatorRequirements::for_offer(
                offer,
                self.chain.network(),
                resource,
            ),
        };

        let policy = RetryPolicy::facilitator_verify();
        let verification = policy
            .run(FacilitatorClientError::is_transient, || {
                self.facilitator.verify(&request)
            })
            .await?;
        if !verification.is_valid {
            return Err(PaymentError::VerificationFailed(
                verification
                    .invalid_reason
                    .unwrap_or_else(|| "facilitator rejected the payment".to_string()),
            ));
        }

        let settlement = self.facilitator.settle(&request).await?;
        if !settlement.success {
            return Err(PaymentError::VerificationFailed(
                settlement
                    .error_reason
                    .unwrap_or_else(|| "facilitator settlement failed".to_string()),
            ));
        }
        let signature = settlement.transaction.ok_or_else(|| {
            PaymentError::VerificationFailed("facilitator returned no transaction".to_string())
        })?;

        let payer = match envelope.transfer_authority() {
            Ok(authority) => Some(authority.to_string()),
            Err(error) => {
                tracing::debug!(%error, "Falling back to facilitator-reported payer");
                settlement.payer
            }
        };

        Ok(VerifiedPayment { signature, payer })
    }

    /// Strategy T: trust the hash, fetch the transaction once to populate
    /// the payer eagerly. A failed fetch stores an empty payer; the refund
    /// path then reports `not-applicable` instead of guessing a target.
    async fn verify_tx_hash(&self, hash: &str) -> Result<VerifiedPayment, PaymentError> {
        let signature = Signature::from_str(hash).map_err(|_| {
            PaymentError::VerificationFailed(format!("invalid transaction hash: {hash}"))
        })?;

        let payer = match self.chain.get_transaction(&signature).await {
            Ok(fetched) => fetched
                .transaction
                .transaction
                .decode()
                .and_then(|tx| tx.message.static_account_keys().first().copied())
                .map(|key| key.to_string()),
            Err(error) => {
                tracing::debug!(%error, tx = hash, "Could not enrich trusted tx-hash with payer");
                None
            }
        };

        Ok(VerifiedPayment {
            signature: signature.to_string(),
            payer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_variants_are_distinct() {
        let reference = Reference::new_rand();
        let by_reference = PaymentProof::OnChainReference(reference);
        let by_hash = PaymentProof::TxHash("5".repeat(87));
        assert!(matches!(by_reference, PaymentProof::OnChainReference(_)));
        assert!(matches!(by_hash, PaymentProof::TxHash(_)));
    }
}
