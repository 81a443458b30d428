//! Reward claim rows: one per disbursed reward, unique on
//! `(offer, wallet, reference)`, counted to enforce per-user claim caps.

use sqlx::PgPool;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Clone)]
pub struct ClaimStore {
    pool: PgPool,
}

impl ClaimStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn count_for_user(&self, offer_id: Uuid, wallet: &str) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM reward_claims WHERE offer_id = $1 AND user_wallet = $2",
        )
        .bind(offer_id)
        .bind(wallet)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn insert(
        &self,
        offer_id: Uuid,
        wallet: &str,
        reference: &str,
        disbursed_signature: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO reward_claims (id, offer_id, user_wallet, reference, disbursed_signature) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(offer_id)
        .bind(wallet)
        .bind(reference)
        .bind(disbursed_signature)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(())
    }
}
