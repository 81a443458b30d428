//! Offer catalog rows: priced endpoints and their configuration.
//!
//! Offers are immutable once created apart from their status and the
//! counters maintained by the proxy (run count, upstream health). The
//! catalog CRUD surface itself lives elsewhere; the proxy only reads offers
//! and bumps counters.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

use crate::chain::{Address, PaymentToken};
use crate::store::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferMode {
    Charge,
    Reward,
}

impl OfferMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferMode::Charge => "charge",
            OfferMode::Reward => "reward",
        }
    }
}

impl Display for OfferMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "charge" => Ok(OfferMode::Charge),
            "reward" => Ok(OfferMode::Reward),
            other => Err(format!("Unknown offer mode: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Active,
    Paused,
    Archived,
}

impl OfferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Active => "active",
            OfferStatus::Paused => "paused",
            OfferStatus::Archived => "archived",
        }
    }
}

impl Display for OfferStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OfferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(OfferStatus::Active),
            "paused" => Ok(OfferStatus::Paused),
            "archived" => Ok(OfferStatus::Archived),
            other => Err(format!("Unknown offer status: {other}")),
        }
    }
}

/// Upstream health derived from the circuit-breaker counters. Feeds catalog
/// visibility only; the proxy path never short-circuits on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One declared input parameter of an offer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl InputField {
    fn matches_type(&self, value: &JsonValue) -> bool {
        match self.field_type.as_str() {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            // Unknown declared types do not reject anything.
            _ => true,
        }
    }
}

/// A priced endpoint record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Offer {
    pub id: Uuid,
    pub slug: String,
    pub title: String,
    pub description: Option<String>,
    pub upstream_url: String,
    pub method: String,
    /// Price in the payment token's smallest unit. Zero for reward offers.
    pub price: i64,
    pub mode: OfferMode,
    pub status: OfferStatus,
    pub payout_wallet: Address,
    pub payment_token: PaymentToken,
    pub reward_amount: Option<i64>,
    pub funded_wallet: Option<Address>,
    pub max_claims_per_user: Option<i32>,
    pub input_schema: Option<Vec<InputField>>,
    pub creator_id: Uuid,
    pub run_count: i64,
    pub upstream_success: i64,
    pub upstream_failure: i64,
    pub consecutive_failures: i32,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn is_active(&self) -> bool {
        self.status == OfferStatus::Active
    }

    pub fn health(&self) -> OfferHealth {
        if self.consecutive_failures >= 5 {
            return OfferHealth::Unhealthy;
        }
        let total = self.upstream_success + self.upstream_failure;
        if self.consecutive_failures >= 2
            || (total >= 20 && self.upstream_failure * 4 > total)
        {
            return OfferHealth::Degraded;
        }
        OfferHealth::Healthy
    }

    /// Validates forwarded inputs against the declared schema: required
    /// fields present, declared types respected, patterns matched.
    ///
    /// Returns the first violation as a human-readable message.
    pub fn validate_inputs(
        &self,
        inputs: &serde_json::Map<String, JsonValue>,
    ) -> Result<(), String> {
        let Some(schema) = &self.input_schema else {
            return Ok(());
        };
        for field in schema {
            let value = inputs.get(&field.name);
            let Some(value) = value else {
                if field.required {
                    return Err(format!("Missing required input: {}", field.name));
                }
                continue;
            };
            if !field.matches_type(value) {
                return Err(format!(
                    "Input {} must be of type {}",
                    field.name, field.field_type
                ));
            }
            if let (Some(pattern), Some(s)) = (&field.pattern, value.as_str()) {
                let re = Regex::new(pattern)
                    .map_err(|_| format!("Offer declares an invalid pattern for {}", field.name))?;
                if !re.is_match(s) {
                    return Err(format!("Input {} does not match expected format", field.name));
                }
            }
        }
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct OfferRow {
    id: Uuid,
    slug: String,
    title: String,
    description: Option<String>,
    upstream_url: String,
    method: String,
    price: i64,
    mode: String,
    status: String,
    payout_wallet: String,
    payment_token: String,
    reward_amount: Option<i64>,
    funded_wallet: Option<String>,
    max_claims_per_user: Option<i32>,
    input_schema: Option<JsonValue>,
    creator_id: Uuid,
    run_count: i64,
    upstream_success: i64,
    upstream_failure: i64,
    consecutive_failures: i32,
    created_at: DateTime<Utc>,
}

impl TryFrom<OfferRow> for Offer {
    type Error = StoreError;

    fn try_from(row: OfferRow) -> Result<Self, Self::Error> {
        let corrupt = |what: &str, detail: String| StoreError::Corrupt(format!("{what}: {detail}"));
        let input_schema = row
            .input_schema
            .map(serde_json::from_value::<Vec<InputField>>)
            .transpose()
            .map_err(|e| corrupt("input_schema", e.to_string()))?;
        Ok(Offer {
            id: row.id,
            slug: row.slug,
            title: row.title,
            description: row.description,
            upstream_url: row.upstream_url,
            method: row.method,
            price: row.price,
            mode: row.mode.parse().map_err(|e| corrupt("mode", e))?,
            status: row.status.parse().map_err(|e| corrupt("status", e))?,
            payout_wallet: row
                .payout_wallet
                .parse()
                .map_err(|e| corrupt("payout_wallet", e))?,
            payment_token: row
                .payment_token
                .parse()
                .map_err(|e| corrupt("payment_token", e))?,
            reward_amount: row.reward_amount,
            funded_wallet: row
                .funded_wallet
                .map(|w| w.parse().map_err(|e| corrupt("funded_wallet", e)))
                .transpose()?,
            max_claims_per_user: row.max_claims_per_user,
            input_schema,
            creator_id: row.creator_id,
            run_count: row.run_count,
            upstream_success: row.upstream_success,
            upstream_failure: row.upstream_failure,
            consecutive_failures: row.consecutive_failures,
            created_at: row.created_at,
        })
    }
}

const OFFER_COLUMNS: &str = "id, slug, title, description, upstream_url, method, price, mode, \
     status, payout_wallet, payment_token, reward_amount, funded_wallet, max_claims_per_user, \
     input_schema, creator_id, run_count, upstream_success, upstream_failure, \
     consecutive_failures, created_at";

/// Read and counter-update access to the offer catalog.
#[derive(Clone)]
pub struct OfferStore {
    pool: PgPool,
}

impl OfferStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<Offer>, StoreError> {
        let query = format!("SELECT {OFFER_COLUMNS} FROM offers WHERE slug = $1");
        let row = sqlx::query_as::<_, OfferRow>(&query)
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Offer::try_from).transpose()
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Offer>, StoreError> {
        let query = format!("SELECT {OFFER_COLUMNS} FROM offers WHERE id = $1");
        let row = sqlx::query_as::<_, OfferRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Offer::try_from).transpose()
    }

    /// Inserts a new offer. Used by seeding tooling; the proxy itself never
    /// creates offers.
    pub async fn insert(&self, offer: &Offer) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO offers (id, slug, title, description, upstream_url, method, price, \
             mode, status, payout_wallet, payment_token, reward_amount, funded_wallet, \
             max_claims_per_user, input_schema, creator_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(offer.id)
        .bind(&offer.slug)
        .bind(&offer.title)
        .bind(&offer.description)
        .bind(&offer.upstream_url)
        .bind(&offer.method)
        .bind(offer.price)
        .bind(offer.mode.as_str())
        .bind(offer.status.as_str())
        .bind(offer.payout_wallet.to_string())
        .bind(offer.payment_token.mint_str())
        .bind(offer.reward_amount)
        .bind(offer.funded_wallet.map(|w| w.to_string()))
        .bind(offer.max_claims_per_user)
        .bind(
            offer
                .input_schema
                .as_ref()
                .map(|s| serde_json::to_value(s).expect("input schema serializes")),
        )
        .bind(offer.creator_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Records an upstream attempt outcome on the offer's breaker counters.
    pub async fn record_upstream_result(
        &self,
        offer_id: Uuid,
        success: bool,
    ) -> Result<(), StoreError> {
        let query = if success {
            "UPDATE offers SET upstream_success = upstream_success + 1, consecutive_failures = 0 \
             WHERE id = $1"
        } else {
            "UPDATE offers SET upstream_failure = upstream_failure + 1, \
             consecutive_failures = consecutive_failures + 1 WHERE id = $1"
        };
        sqlx::query(query).bind(offer_id).execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn offer_with_counters(success: i64, failure: i64, consecutive: i32) -> Offer {
        Offer {
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
            upstream_success: success,
            upstream_failure: failure,
            consecutive_failures: consecutive,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn health_from_breaker_counters() {
        assert_eq!(offer_with_counters(100, 0, 0).health(), OfferHealth::Healthy);
        assert_eq!(offer_with_counters(10, 1, 2).health(), OfferHealth::Degraded);
        assert_eq!(
            offer_with_counters(10, 10, 1).health(),
            OfferHealth::Degraded
        );
        assert_eq!(
            offer_with_counters(0, 10, 5).health(),
            OfferHealth::Unhealthy
        );
    }

    #[test]
    fn input_validation_required_and_pattern() {
        let mut offer = offer_with_counters(0, 0, 0);
        offer.input_schema = Some(vec![
            InputField {
                name: "city".into(),
                field_type: "string".into(),
                required: true,
                pattern: Some("^[A-Za-z ]+$".into()),
            },
            InputField {
                name: "days".into(),
                field_type: "number".into(),
                required: false,
                pattern: None,
            },
        ]);

        let mut inputs = serde_json::Map::new();
        assert!(offer.validate_inputs(&inputs).is_err());

        inputs.insert("city".into(), JsonValue::String("Lisbon".into()));
        assert!(offer.validate_inputs(&inputs).is_ok());

        inputs.insert("city".into(), JsonValue::String("§§§".into()));
        assert!(offer.validate_inputs(&inputs).is_err());

        inputs.insert("city".into(), JsonValue::String("Lisbon".into()));
        inputs.insert("days".into(), JsonValue::String("three".into()));
        assert!(offer.validate_inputs(&inputs).is_err());
    }

    #[test]
    fn mode_and_status_parse() {
        assert_eq!(OfferMode::from_str("charge").unwrap(), OfferMode::Charge);
        assert_eq!(OfferStatus::from_str("paused").unwrap(), OfferStatus::Paused);
        assert!(OfferMode::from_str("free").is_err());
    }
}
