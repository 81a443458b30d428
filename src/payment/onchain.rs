//! Direct on-chain payment verification by reference scan.
//!
//! When a client pays without a facilitator it embeds the run reference as a
//! read-only key on its transfer and then calls the proxy with nothing but
//! that reference. Verification is a chain scan: find the newest confirmed
//! transaction mentioning the reference, fetch it, and check from the
//! balance deltas in its meta that the expected recipient was credited at
//! least the expected amount of the expected token.

use solana_signature::Signature;
use solana_transaction_status_client_types::option_serializer::OptionSerializer;
use solana_transaction_status_client_types::{
    TransactionConfirmationStatus, UiTransactionTokenBalance,
};
use std::str::FromStr;

use crate::chain::{Address, ChainError, ChainProvider, PaymentToken, Reference};
use crate::retry::RetryPolicy;

#[derive(Debug, thiserror::Error)]
pub enum OnChainError {
    #[error("No confirmed transaction found for reference")]
    NotFound,
    #[error("Referenced transaction failed on-chain")]
    TransactionFailed,
    #[error("Transaction meta unavailable")]
    MissingMeta,
    #[error("Transaction could not be decoded")]
    Undecodable,
    #[error("Invalid signature in scan result: {0}")]
    BadSignature(String),
    #[error("Expected recipient was not credited")]
    RecipientNotCredited,
    #[error("Transferred amount {actual} below required {expected}")]
    AmountInsufficient { expected: u64, actual: u64 },
    #[error(transparent)]
    Chain(#[from] ChainError),
}

impl OnChainError {
    pub fn is_transient(&self) -> bool {
        match self {
            // Propagation lag: the transfer may simply not be visible yet.
            OnChainError::NotFound | OnChainError::MissingMeta => true,
            OnChainError::Chain(chain) => chain.is_transient(),
            _ => false,
        }
    }
}

/// Outcome of a successful scan: the settled signature and, when it could be
/// derived from the balance movements, the paying wallet.
#[derive(Clone, Debug)]
pub struct VerifiedTransfer {
    pub signature: String,
    pub payer: Option<String>,
}

/// Scans the chain for a confirmed payment carrying `reference` and
/// validates it against the offer's terms. Bounded retries absorb the lag
/// between client broadcast and indexer visibility.
pub async fn verify_reference(
    chain: &ChainProvider,
    reference: &Reference,
    recipient: &Address,
    token: &PaymentToken,
    min_amount: u64,
) -> Result<VerifiedTransfer, OnChainError> {
    let policy = RetryPolicy::onchain_lookup();
    policy
        .run(OnChainError::is_transient, || {
            scan_once(chain, reference, recipient, token, min_amount)
        })
        .await
}

async fn scan_once(
    chain: &ChainProvider,
    reference: &Reference,
    recipient: &Address,
    token: &PaymentToken,
    min_amount: u64,
) -> Result<VerifiedTransfer, OnChainError> {
    let statuses = chain
        .signatures_for_address(reference.pubkey(), 5)
        .await?;
    let confirmed = statuses
        .into_iter()
        .find(|status| {
            status.err.is_none()
                && !matches!(
                    status.confirmation_status,
                    Some(TransactionConfirmationStatus::Processed)
                )
        })
        .ok_or(OnChainError::NotFound)?;

    let signature = Signature::from_str(&confirmed.signature)
        .map_err(|_| OnChainError::BadSignature(confirmed.signature.clone()))?;
    let fetched = chain.get_transaction(&signature).await?;
    let meta = fetched
        .transaction
        .meta
        .ok_or(OnChainError::MissingMeta)?;
    if meta.err.is_some() {
        return Err(OnChainError::TransactionFailed);
    }
    let tx = fetched
        .transaction
        .transaction
        .decode()
        .ok_or(OnChainError::Undecodable)?;
    let keys: Vec<String> = tx
        .message
        .static_account_keys()
        .iter()
        .map(|k| k.to_string())
        .collect();

    let payer = match token {
        PaymentToken::Native => validate_native_credit(
            &keys,
            &meta.pre_balances,
            &meta.post_balances,
            &recipient.to_string(),
            min_amount,
        )?,
        PaymentToken::Mint(mint) => {
            let pre: Vec<UiTransactionTokenBalance> =
                Option::from(meta.pre_token_balances).unwrap_or_default();
            let post: Vec<UiTransactionTokenBalance> =
                Option::from(meta.post_token_balances).unwrap_or_default();
            validate_token_credit(
                &pre,
                &post,
                &mint.to_string(),
                &recipient.to_string(),
                min_amount,
            )?
        }
    };

    // Fee payer is the first account key; used when the token-balance owner
    // diff does not name a payer.
    let payer = payer.or_else(|| keys.first().cloned());

    Ok(VerifiedTransfer {
        signature: signature.to_string(),
        payer,
    })
}

/// Checks that `recipient` gained at least `min_amount` lamports. The payer
/// for native transfers is the fee payer, resolved by the caller.
fn validate_native_credit(
    keys: &[String],
    pre_balances: &[u64],
    post_balances: &[u64],
    recipient: &str,
    min_amount: u64,
) -> Result<Option<String>, OnChainError> {
    let index = keys
        .iter()
        .position(|k| k == recipient)
        .ok_or(OnChainError::RecipientNotCredited)?;
    let pre = pre_balances.get(index).copied().unwrap_or(0);
    let post = post_balances.get(index).copied().unwrap_or(0);
    let credit = post.saturating_sub(pre);
    if credit < min_amount {
        return Err(OnChainError::AmountInsufficient {
            expected: min_amount,
            actual: credit,
        });
    }
    Ok(None)
}

/// Checks that `recipient` gained at least `min_amount` of `mint`, and
/// derives the payer as the owner whose balance in that mint decreased.
fn validate_token_credit(
    pre: &[UiTransactionTokenBalance],
    post: &[UiTransactionTokenBalance],
    mint: &str,
    recipient: &str,
    min_amount: u64,
) -> Result<Option<String>, OnChainError> {
    let owner_of = |balance: &UiTransactionTokenBalance| -> Option<String> {
        Option::<String>::from(balance.owner.clone())
    };
    let raw_amount =
        |balance: &UiTransactionTokenBalance| balance.ui_token_amount.amount.parse::<u64>().unwrap_or(0);

    let credited = post
        .iter()
        .find(|b| b.mint == mint && owner_of(b).as_deref() == Some(recipient))
        .ok_or(OnChainError::RecipientNotCredited)?;
    let pre_amount = pre
        .iter()
        .find(|b| b.account_index == credited.account_index)
        .map(raw_amount)
        .unwrap_or(0);
    let credit = raw_amount(credited).saturating_sub(pre_amount);
    if credit < min_amount {
        return Err(OnChainError::AmountInsufficient {
            expected: min_amount,
            actual: credit,
        });
    }

    let payer = pre.iter().find_map(|before| {
        if before.mint != mint {
            return None;
        }
        let owner = owner_of(before)?;
        if owner == recipient {
            return None;
        }
        let after = post
            .iter()
            .find(|b| b.account_index == before.account_index)
            .map(raw_amount)
            .unwrap_or(0);
        (raw_amount(before) > after).then_some(owner)
    });

    Ok(payer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_transaction_status_client_types::UiTokenAmount;

    fn token_balance(
        account_index: u8,
        mint: &str,
        owner: &str,
        amount: u64,
    ) -> UiTransactionTokenBalance {
        UiTransactionTokenBalance {
            account_index,
            mint: mint.to_string(),
            ui_token_amount: UiTokenAmount {
                ui_amount: None,
                decimals: 6,
                amount: amount.to_string(),
                ui_amount_string: String::new(),
            },
            owner: OptionSerializer::Some(owner.to_string()),
            program_id: OptionSerializer::Skip,
        }
    }

    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const RECIPIENT: &str = "4zMMC9srt5Ri5X14GAgXhaHii3GnPAEERYPJgZ5nc4pb";
    const PAYER: &str = "7WNkC3cjwngUYWrAjEwXHgWvk3S2ZPogahd6DFHkXiXS";

    #[test]
    fn token_credit_finds_payer_and_amount() {
        let pre = vec![
            token_balance(1, MINT, PAYER, 50_000),
            token_balance(2, MINT, RECIPIENT, 0),
        ];
        let post = vec![
            token_balance(1, MINT, PAYER, 40_000),
            token_balance(2, MINT, RECIPIENT, 10_000),
        ];
        let payer = validate_token_credit(&pre, &post, MINT, RECIPIENT, 10_000).unwrap();
        assert_eq!(payer.as_deref(), Some(PAYER));
    }

    #[test]
    fn token_credit_rejects_short_payment() {
        let pre = vec![token_balance(2, MINT, RECIPIENT, 0)];
        let post = vec![token_balance(2, MINT, RECIPIENT, 9_999)];
        let err = validate_token_credit(&pre, &post, MINT, RECIPIENT, 10_000).unwrap_err();
        assert!(matches!(
            err,
            OnChainError::AmountInsufficient {
                expected: 10_000,
                actual: 9_999
            }
        ));
    }

    #[test]
    fn token_credit_rejects_wrong_mint() {
        let other_mint = "So11111111111111111111111111111111111111112";
        let post = vec![token_balance(2, other_mint, RECIPIENT, 10_000)];
        let err = validate_token_credit(&[], &post, MINT, RECIPIENT, 10_000).unwrap_err();
        assert!(matches!(err, OnChainError::RecipientNotCredited));
    }

    #[test]
    fn native_credit_checks_balance_delta() {
        let keys = vec![PAYER.to_string(), RECIPIENT.to_string()];
        let pre = vec![1_000_000, 500];
        let post = vec![989_500, 10_500];
        assert!(validate_native_credit(&keys, &pre, &post, RECIPIENT, 10_000).is_ok());

        let err = validate_native_credit(&keys, &pre, &post, RECIPIENT, 20_000).unwrap_err();
        assert!(matches!(err, OnChainError::AmountInsufficient { .. }));

        let err = validate_native_credit(&keys, &pre, &post, PAYER, 1).unwrap_err();
        assert!(matches!(err, OnChainError::AmountInsufficient { .. }));
    }

    #[test]
    fn native_credit_requires_recipient_key() {
        let keys = vec![PAYER.to_string()];
        let err = validate_native_credit(&keys, &[0], &[0], RECIPIENT, 1).unwrap_err();
        assert!(matches!(err, OnChainError::RecipientNotCredited));
    }
}
