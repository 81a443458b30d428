//! The `X-Payment` envelope: a base64-encoded JSON structure carrying a
//! pre-signed payment transaction plus protocol metadata.
//!
//! The envelope is what a facilitator-paying client submits. The proxy never
//! broadcasts it itself (the facilitator does), but it does introspect the
//! embedded transaction to find the effective payer: the authority of the
//! token-transfer instruction, which is not necessarily the fee payer (the
//! facilitator may front fees).

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use solana_transaction::versioned::VersionedTransaction;

use crate::chain::Address;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Payment envelope is not valid base64")]
    InvalidBase64,
    #[error("Payment envelope is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("Unsupported envelope version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unsupported payment scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Envelope transaction could not be decoded: {0}")]
    InvalidTransaction(String),
    #[error("Envelope transaction carries no token transfer instruction")]
    NoTransferInstruction,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeWire {
    x402_version: u8,
    scheme: String,
    network: String,
    payload: EnvelopePayload,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopePayload {
    /// Base64 of the bincode-serialized signed transaction.
    transaction: String,
}

/// A decoded `X-Payment` header.
#[derive(Clone, Debug)]
pub struct PaymentEnvelope {
    wire: EnvelopeWire,
}

impl PaymentEnvelope {
    /// Decodes the base64 header value into an envelope, validating version
    /// and scheme.
    pub fn from_header(header: &str) -> Result<Self, EnvelopeError> {
        let bytes = BASE64
            .decode(header.trim())
            .map_err(|_| EnvelopeError::InvalidBase64)?;
        let wire: EnvelopeWire =
            serde_json::from_slice(&bytes).map_err(|e| EnvelopeError::InvalidJson(e.to_string()))?;
        if wire.x402_version != 1 {
            return Err(EnvelopeError::UnsupportedVersion(wire.x402_version));
        }
        if wire.scheme != "exact" {
            return Err(EnvelopeError::UnsupportedScheme(wire.scheme));
        }
        Ok(Self { wire })
    }

    pub fn network(&self) -> &str {
        &self.wire.network
    }

    /// The envelope as the facilitator expects it in `paymentPayload`.
    pub fn as_payload_json(&self) -> JsonValue {
        serde_json::to_value(&self.wire).expect("envelope wire serializes")
    }

    /// Recovers the signed transaction embedded in the envelope.
    pub fn decode_transaction(&self) -> Result<VersionedTransaction, EnvelopeError> {
        let bytes = BASE64
            .decode(&self.wire.payload.transaction)
            .map_err(|_| EnvelopeError::InvalidBase64)?;
        bincode::deserialize(&bytes).map_err(|e| EnvelopeError::InvalidTransaction(e.to_string()))
    }

    /// Extracts the effective payer: the authority account of the SPL
    /// `TransferChecked` instruction (account index 3).
    pub fn transfer_authority(&self) -> Result<Address, EnvelopeError> {
        let tx = self.decode_transaction()?;
        let keys = tx.message.static_account_keys();
        for instruction in tx.message.instructions() {
            let program_id = keys
                .get(instruction.program_id_index as usize)
                .ok_or(EnvelopeError::InvalidTransaction("bad program index".into()))?;

            let is_transfer_checked = if *program_id == spl_token::ID {
                matches!(
                    spl_token::instruction::TokenInstruction::unpack(&instruction.data),
                    Ok(spl_token::instruction::TokenInstruction::TransferChecked { .. })
                )
            } else if *program_id == spl_token_2022::ID {
                matches!(
                    spl_token_2022::instruction::TokenInstruction::unpack(&instruction.data),
                    Ok(spl_token_2022::instruction::TokenInstruction::TransferChecked { .. })
                )
            } else {
                false
            };
            if !is_transfer_checked {
                continue;
            }

            // TransferChecked accounts: source, mint, destination, authority.
            let authority_index = *instruction
                .accounts
                .get(3)
                .ok_or(EnvelopeError::InvalidTransaction("missing authority".into()))?;
            let authority = keys
                .get(authority_index as usize)
                .ok_or(EnvelopeError::InvalidTransaction("bad account index".into()))?;
            return Ok(Address::new(*authority));
        }
        Err(EnvelopeError::NoTransferInstruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use solana_message::{Message, VersionedMessage};
    use solana_pubkey::Pubkey;
    use solana_signature::Signature;

    fn envelope_with_transaction(tx: &VersionedTransaction) -> String {
        let tx_b64 = BASE64.encode(bincode::serialize(tx).unwrap());
        let wire = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": "solana",
            "payload": { "transaction": tx_b64 },
        });
        BASE64.encode(serde_json::to_vec(&wire).unwrap())
    }

    fn transfer_transaction(authority: Pubkey) -> VersionedTransaction {
        let fee_payer = Pubkey::new_unique();
        let source = Pubkey::new_unique();
        let mint = Pubkey::new_unique();
        let destination = Pubkey::new_unique();
        let instruction = spl_token::instruction::transfer_checked(
            &spl_token::ID,
            &source,
            &mint,
            &destination,
            &authority,
            &[],
            10_000,
            6,
        )
        .unwrap();
        let message = Message::new(&[instruction], Some(&fee_payer));
        let signatures = vec![Signature::default(); message.header.num_required_signatures as usize];
        VersionedTransaction {
            signatures,
            message: VersionedMessage::Legacy(message),
        }
    }

    #[test]
    fn decodes_and_extracts_authority() {
        let authority = Pubkey::new_unique();
        let tx = transfer_transaction(authority);
        let header = envelope_with_transaction(&tx);

        let envelope = PaymentEnvelope::from_header(&header).unwrap();
        assert_eq!(envelope.network(), "solana");
        let payer = envelope.transfer_authority().unwrap();
        assert_eq!(*payer.pubkey(), authority);
    }

    #[test]
    fn rejects_wrong_version_and_scheme() {
        let wire = serde_json::json!({
            "x402Version": 2,
            "scheme": "exact",
            "network": "solana",
            "payload": { "transaction": "" },
        });
        let header = BASE64.encode(serde_json::to_vec(&wire).unwrap());
        assert!(matches!(
            PaymentEnvelope::from_header(&header),
            Err(EnvelopeError::UnsupportedVersion(2))
        ));

        let wire = serde_json::json!({
            "x402Version": 1,
            "scheme": "upto",
            "network": "solana",
            "payload": { "transaction": "" },
        });
        let header = BASE64.encode(serde_json::to_vec(&wire).unwrap());
        assert!(matches!(
            PaymentEnvelope::from_header(&header),
            Err(EnvelopeError::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn rejects_garbage_header() {
        assert!(matches!(
            PaymentEnvelope::from_header("%%%not-base64%%%"),
            Err(EnvelopeError::InvalidBase64)
        ));
        let header = BASE64.encode(b"not json");
        assert!(matches!(
            PaymentEnvelope::from_header(&header),
            Err(EnvelopeError::InvalidJson(_))
        ));
    }

    #[test]
    fn transaction_without_transfer_yields_no_authority() {
        let fee_payer = Pubkey::new_unique();
        let memo = spl_memo::build_memo(b"hello", &[&fee_payer]);
        let message = Message::new(&[memo], Some(&fee_payer));
        let signatures = vec![Signature::default(); message.header.num_required_signatures as usize];
        let tx = VersionedTransaction {
            signatures,
            message: VersionedMessage::Legacy(message),
        };
        let header = envelope_with_transaction(&tx);
        let envelope = PaymentEnvelope::from_header(&header).unwrap();
        assert!(matches!(
            envelope.transfer_authority(),
            Err(EnvelopeError::NoTransferInstruction)
        ));
    }
}
