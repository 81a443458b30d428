//! The payment-requirements block of a 402 response.
//!
//! This is the contract a paying client fulfills: recipient, token mint (or
//! the native sentinel), the amount in smallest units as a decimal string,
//! the network tag, and the `exact` scheme marker.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::chain::{Address, SolanaNetwork};
use crate::store::Offer;

/// Scheme marker that always serializes as the string `"exact"`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct ExactScheme;

impl ExactScheme {
    pub const VALUE: &'static str = "exact";
}

impl fmt::Display for ExactScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::VALUE)
    }
}

impl Serialize for ExactScheme {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(Self::VALUE)
    }
}

impl<'de> Deserialize<'de> for ExactScheme {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s == Self::VALUE {
            Ok(ExactScheme)
        } else {
            Err(serde::de::Error::custom(format!(
                "expected scheme {}, got {s}",
                Self::VALUE
            )))
        }
    }
}

/// The `payment` object of a 402 body.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirements {
    pub recipient_wallet: Address,
    /// Token mint address, or `"native"` for SOL.
    pub mint: String,
    /// Amount in the token's smallest unit, as a decimal string.
    pub amount: String,
    pub network: SolanaNetwork,
    pub scheme: ExactScheme,
}

impl PaymentRequirements {
    pub fn for_offer(offer: &Offer, network: SolanaNetwork) -> Self {
        Self {
            recipient_wallet: offer.payout_wallet,
            mint: offer.payment_token.mint_str(),
            amount: offer.price.to_string(),
            network,
            scheme: ExactScheme,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::PaymentToken;
    use crate::store::{OfferMode, OfferStatus};
    use chrono::Utc;
    use std::str::FromStr;
    use uuid::Uuid;

    #[test]
    fn wire_shape_is_camel_case_exact() {
        let offer = Offer {
            id: Uuid::new_v4(),
            slug: "sum".into(),
            title: "Sum".into(),
            description: None,
            upstream_url: "https://api.example.com/sum".into(),
            method: "POST".into(),
            price: 10_000,
            mode: OfferMode::Charge,
            status: OfferStatus::Active,
            payout_wallet: Address::from_str("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v")
                .unwrap(),
            payment_token: PaymentToken::Native,
            reward_amount: None,
            funded_wallet: None,
            max_claims_per_user: None,
            input_schema: None,
            creator_id: Uuid::new_v4(),
            run_count: 0,
            upstream_success: 0,
            upstream_failure: 0,
            consecutive_failures: 0,
            created_at: Utc::now(),
        };
        let requirements = PaymentRequirements::for_offer(&offer, SolanaNetwork::Mainnet);
        let json = serde_json::to_value(&requirements).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "recipientWallet": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
                "mint": "native",
                "amount": "10000",
                "network": "solana",
                "scheme": "exact",
            })
        );
    }

    #[test]
    fn scheme_deserialization_rejects_other_values() {
        assert!(serde_json::from_str::<ExactScheme>("\"exact\"").is_ok());
        assert!(serde_json::from_str::<ExactScheme>("\"upto\"").is_err());
    }
}
