//! RPC provider for the Solana chain.
//!
//! Wraps the nonblocking [`RpcClient`] with the handful of operations the
//! proxy needs: broadcasting outbound transfers (rewards and refunds),
//! confirming them, fetching settled transactions for verification, and
//! scanning for transactions that carry a run reference as an account key.
//!
//! Outbound transfers are assembled here as well, so reward disbursement and
//! refunds share one code path for compute-budget instructions, associated
//! token accounts, memos, and reference keys.

use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_client::SerializableTransaction;
use solana_client::rpc_config::{
    GetConfirmedSignaturesForAddress2Config, RpcSendTransactionConfig, RpcTransactionConfig,
};
use solana_client::rpc_response::RpcConfirmedTransactionStatusWithSignature;
use solana_commitment_config::CommitmentConfig;
use solana_compute_budget_interface::ComputeBudgetInstruction;
use solana_instruction::AccountMeta;
use solana_keypair::Keypair;
use solana_message::{Message, VersionedMessage};
use solana_pubkey::Pubkey;
use solana_signature::Signature;
use solana_signer::{Signer, SignerError};
use solana_transaction::versioned::VersionedTransaction;
use solana_transaction_status_client_types::{
    EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding,
};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::chain::{PaymentToken, Reference, SolanaNetwork};

const COMPUTE_UNIT_LIMIT: u32 = 100_000;
const COMPUTE_UNIT_PRICE: u64 = 1_000_000;

/// How long [`ChainProvider::send_and_confirm`] polls before giving up.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);
const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Errors that can occur when interacting with the chain.
#[derive(thiserror::Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error(transparent)]
    Transport(Box<ClientErrorKind>),
    #[error("Confirmation timed out for {0}")]
    ConfirmationTimeout(Signature),
}

impl From<ClientError> for ChainError {
    fn from(value: ClientError) -> Self {
        ChainError::Transport(Box::new(value.kind))
    }
}

impl ChainError {
    /// Transient errors are worth retrying (transport hiccups, propagation
    /// lag); everything else is terminal for the current attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChainError::Transport(_) | ChainError::ConfirmationTimeout(_)
        )
    }
}

/// Provider for interacting with a Solana chain over JSON-RPC.
pub struct ChainProvider {
    network: SolanaNetwork,
    rpc_client: Arc<RpcClient>,
}

impl Debug for ChainProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainProvider")
            .field("network", &self.network)
            .field("rpc_url", &self.rpc_client.url())
            .finish()
    }
}

impl ChainProvider {
    pub fn new(rpc_url: String, network: SolanaNetwork) -> Self {
        tracing::info!(network = %network, rpc = %rpc_url, "Using Solana provider");
        Self {
            network,
            rpc_client: Arc::new(RpcClient::new(rpc_url)),
        }
    }

    pub fn network(&self) -> SolanaNetwork {
        self.network
    }

    /// Broadcasts a signed transaction without waiting for confirmation.
    pub async fn send(&self, tx: &VersionedTransaction) -> Result<Signature, ChainError> {
        let signature = self
            .rpc_client
            .send_transaction_with_config(
                tx,
                RpcSendTransactionConfig {
                    skip_preflight: true,
                    ..RpcSendTransactionConfig::default()
                },
            )
            .await?;
        Ok(signature)
    }

    /// Broadcasts a signed transaction and polls until the given commitment
    /// is reached or [`CONFIRM_TIMEOUT`] elapses.
    pub async fn send_and_confirm(
        &self,
        tx: &VersionedTransaction,
        commitment: CommitmentConfig,
    ) -> Result<Signature, ChainError> {
        let tx_sig = tx.get_signature();
        self.send(tx).await?;
        let deadline = tokio::time::Instant::now() + CONFIRM_TIMEOUT;
        loop {
            let confirmed = self
                .rpc_client
                .confirm_transaction_with_commitment(tx_sig, commitment)
                .await?;
            if confirmed.value {
                return Ok(*tx_sig);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ChainError::ConfirmationTimeout(*tx_sig));
            }
            tokio::time::sleep(CONFIRM_POLL_INTERVAL).await;
        }
    }

    /// Fetches a confirmed transaction with its status meta, base64-encoded
    /// so the raw [`VersionedTransaction`] can be recovered.
    pub async fn get_transaction(
        &self,
        signature: &Signature,
    ) -> Result<EncodedConfirmedTransactionWithStatusMeta, ChainError> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        let tx = self
            .rpc_client
            .get_transaction_with_config(signature, config)
            .await?;
        Ok(tx)
    }

    /// Lists confirmed signatures that mention `address` as an account key,
    /// newest first. Run references are looked up this way.
    pub async fn signatures_for_address(
        &self,
        address: &Pubkey,
        limit: usize,
    ) -> Result<Vec<RpcConfirmedTransactionStatusWithSignature>, ChainError> {
        let config = GetConfirmedSignaturesForAddress2Config {
            before: None,
            until: None,
            limit: Some(limit),
            commitment: Some(CommitmentConfig::confirmed()),
        };
        let signatures = self
            .rpc_client
            .get_signatures_for_address_with_config(address, config)
            .await?;
        Ok(signatures)
    }

    async fn mint_decimals(&self, mint: &Pubkey) -> Result<u8, ChainError> {
        let supply = self.rpc_client.get_token_supply(mint).await?;
        Ok(supply.decimals)
    }

    /// Builds and signs a token transfer from `from` to the `to` wallet.
    ///
    /// Native transfers move lamports via the system program; SPL transfers
    /// go through `TransferChecked` against the recipient's associated token
    /// account, creating it idempotently in the same transaction. When a
    /// `reference` is given it is attached to the transfer instruction as a
    /// read-only key so the transaction can later be found by reference.
    pub async fn build_transfer(
        &self,
        from: &Keypair,
        to: &Pubkey,
        token: &PaymentToken,
        amount: u64,
        memo: &str,
        reference: Option<&Reference>,
    ) -> Result<VersionedTransaction, ChainError> {
        let payer = from.pubkey();
        let mut instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(COMPUTE_UNIT_LIMIT),
            ComputeBudgetInstruction::set_compute_unit_price(COMPUTE_UNIT_PRICE),
        ];

        let mut transfer_ix = match token {
            PaymentToken::Native => {
                solana_system_interface::instruction::transfer(&payer, to, amount)
            }
            PaymentToken::Mint(mint) => {
                let mint = *mint.pubkey();
                let decimals = self.mint_decimals(&mint).await?;
                let source = spl_associated_token_account::get_associated_token_address_with_program_id(
                    &payer,
                    &mint,
                    &spl_token::ID,
                );
                let destination =
                    spl_associated_token_account::get_associated_token_address_with_program_id(
                        to,
                        &mint,
                        &spl_token::ID,
                    );
                instructions.push(
                    spl_associated_token_account::instruction::create_associated_token_account_idempotent(
                        &payer,
                        to,
                        &mint,
                        &spl_token::ID,
                    ),
                );
                spl_token::instruction::transfer_checked(
                    &spl_token::ID,
                    &source,
                    &mint,
                    &destination,
                    &payer,
                    &[],
                    amount,
                    decimals,
                )
                .map_err(|e| ChainError::InvalidTransaction(e.to_string()))?
            }
        };
        if let Some(reference) = reference {
            transfer_ix
                .accounts
                .push(AccountMeta::new_readonly(*reference.pubkey(), false));
        }
        instructions.push(transfer_ix);
        instructions.push(spl_memo::build_memo(memo.as_bytes(), &[&payer]));

        let blockhash = self.rpc_client.get_latest_blockhash().await?;
        let message = Message::new_with_blockhash(&instructions, Some(&payer), &blockhash);
        let tx = VersionedTransaction::try_new(VersionedMessage::Legacy(message), &[from])?;
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_rides_as_readonly_key() {
        let payer = Keypair::new();
        let reference = Reference::new_rand();
        let mut transfer_ix = solana_system_interface::instruction::transfer(
            &payer.pubkey(),
            &Pubkey::new_unique(),
            5_000,
        );
        transfer_ix
            .accounts
            .push(AccountMeta::new_readonly(*reference.pubkey(), false));

        let tagged = transfer_ix
            .accounts
            .iter()
            .find(|meta| meta.pubkey == *reference.pubkey())
            .unwrap();
        assert!(!tagged.is_writable);
        assert!(!tagged.is_signer);
    }

    #[test]
    fn transient_classification() {
        assert!(ChainError::Transport(Box::new(ClientErrorKind::Custom("x".into()))).is_transient());
        assert!(!ChainError::InvalidTransaction("bad".into()).is_transient());
    }
}
