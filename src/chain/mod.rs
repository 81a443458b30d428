//! Solana chain types and the RPC provider used for payment verification
//! and outbound disbursement.
//!
//! The proxy moves value on a single account-based chain. Addresses are
//! base58-encoded ed25519 public keys, payments settle either in native SOL
//! (lamports) or in an SPL token identified by its mint address, and every
//! run carries a client-chosen 32-byte [`Reference`] that doubles as a
//! read-only account key on the transfer instruction, which is what makes
//! on-chain discovery of a payment possible.

pub mod provider;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use solana_pubkey::Pubkey;
use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

pub use provider::{ChainError, ChainProvider};

/// A Solana public key address, serialized as a base58 string.
#[derive(Clone, Copy, Hash, PartialEq, Eq)]
pub struct Address(Pubkey);

impl Address {
    pub const fn new(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }

    pub fn pubkey(&self) -> &Pubkey {
        &self.0
    }

    /// Shortened form for echoing back in rate-limit bodies: first and last
    /// four characters of the base58 encoding.
    pub fn truncated(&self) -> String {
        let full = self.0.to_string();
        if full.len() <= 8 {
            return full;
        }
        format!("{}…{}", &full[..4], &full[full.len() - 4..])
    }
}

impl Debug for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl From<Pubkey> for Address {
    fn from(pubkey: Pubkey) -> Self {
        Self(pubkey)
    }
}

impl From<Address> for Pubkey {
    fn from(address: Address) -> Self {
        address.0
    }
}

impl AsRef<[u8]> for Address {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pubkey =
            Pubkey::from_str(s).map_err(|_| format!("Failed to decode Solana address: {s}"))?;
        Ok(Self(pubkey))
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A client-chosen 256-bit run identifier, carried as a base58 string.
///
/// References are structurally indistinguishable from addresses: 32 bytes,
/// base58. They never correspond to a funded account; they ride along on the
/// payment transaction as a read-only key so the transaction can be located
/// by `getSignaturesForAddress`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Reference(Pubkey);

impl Reference {
    pub fn pubkey(&self) -> &Pubkey {
        &self.0
    }

    /// Mints a fresh random reference. Used when a client submits a payment
    /// envelope without choosing a reference of its own.
    pub fn new_rand() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(Pubkey::new_from_array(bytes))
    }
}

impl Debug for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Reference({})", self.0)
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Reference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let pubkey = Pubkey::from_str(s).map_err(|_| format!("Invalid reference: {s}"))?;
        Ok(Self(pubkey))
    }
}

impl Serialize for Reference {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The Solana network the proxy settles on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolanaNetwork {
    Mainnet,
    Devnet,
}

impl SolanaNetwork {
    /// Wire tag used in payment requirements and facilitator requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            SolanaNetwork::Mainnet => "solana",
            SolanaNetwork::Devnet => "solana-devnet",
        }
    }
}

impl Display for SolanaNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SolanaNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "solana" | "mainnet" | "solana-mainnet" => Ok(SolanaNetwork::Mainnet),
            "solana-devnet" | "devnet" => Ok(SolanaNetwork::Devnet),
            other => Err(format!("Unknown Solana network: {other}")),
        }
    }
}

impl Serialize for SolanaNetwork {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SolanaNetwork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Sentinel used in wire formats and offer rows for the native token.
pub const NATIVE_TOKEN: &str = "native";

/// The token an offer is priced (or rewarded) in: native SOL or an SPL mint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentToken {
    Native,
    Mint(Address),
}

impl PaymentToken {
    /// The `mint` value used in 402 payment-requirements bodies.
    pub fn mint_str(&self) -> String {
        match self {
            PaymentToken::Native => NATIVE_TOKEN.to_string(),
            PaymentToken::Mint(mint) => mint.to_string(),
        }
    }
}

impl Display for PaymentToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.mint_str())
    }
}

impl FromStr for PaymentToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case(NATIVE_TOKEN) {
            return Ok(PaymentToken::Native);
        }
        let mint = Address::from_str(s).map_err(|_| format!("Invalid payment token: {s}"))?;
        Ok(PaymentToken::Mint(mint))
    }
}

impl Serialize for PaymentToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.mint_str())
    }
}

impl<'de> Deserialize<'de> for PaymentToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    #[test]
    fn address_roundtrip() {
        let address = Address::from_str(USDC_MINT).unwrap();
        assert_eq!(address.to_string(), USDC_MINT);
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(json, format!("\"{USDC_MINT}\""));
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, address);
    }

    #[test]
    fn address_truncation_hides_middle() {
        let address = Address::from_str(USDC_MINT).unwrap();
        let short = address.truncated();
        assert!(short.starts_with("EPjF"));
        assert!(short.ends_with("Dt1v"));
        assert!(short.len() < USDC_MINT.len());
    }

    #[test]
    fn reference_rejects_garbage() {
        assert!(Reference::from_str("not-base58-!!").is_err());
        assert!(Reference::from_str("").is_err());
    }

    #[test]
    fn reference_generates_valid_base58() {
        let reference = Reference::new_rand();
        let parsed = Reference::from_str(&reference.to_string()).unwrap();
        assert_eq!(parsed, reference);
    }

    #[test]
    fn network_parse_aliases() {
        assert_eq!(
            SolanaNetwork::from_str("mainnet").unwrap(),
            SolanaNetwork::Mainnet
        );
        assert_eq!(
            SolanaNetwork::from_str("devnet").unwrap(),
            SolanaNetwork::Devnet
        );
        assert_eq!(SolanaNetwork::Mainnet.as_str(), "solana");
        assert!(SolanaNetwork::from_str("base-sepolia").is_err());
    }

    #[test]
    fn payment_token_native_and_mint() {
        assert_eq!(
            PaymentToken::from_str("native").unwrap(),
            PaymentToken::Native
        );
        let token = PaymentToken::from_str(USDC_MINT).unwrap();
        assert!(matches!(token, PaymentToken::Mint(_)));
        assert_eq!(token.mint_str(), USDC_MINT);
    }
}
