//! Refund rows and the creator-debt ledger.
//!
//! A refund is a side-table keyed by run id: the run owns the relationship
//! and lookups in either direction go through the `run_id` index. Issuing a
//! refund and recording the matching creator debt happen in one transaction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundStatus {
    Pending,
    Issued,
    Failed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Issued => "issued",
            RefundStatus::Failed => "failed",
        }
    }
}

impl Display for RefundStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefundStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RefundStatus::Pending),
            "issued" => Ok(RefundStatus::Issued),
            "failed" => Ok(RefundStatus::Failed),
            other => Err(format!("Unknown refund status: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Refund {
    pub id: Uuid,
    pub run_id: Uuid,
    pub status: RefundStatus,
    pub signature: Option<String>,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    run_id: Uuid,
    status: String,
    signature: Option<String>,
    amount: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for Refund {
    type Error = StoreError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))?;
        Ok(Refund {
            id: row.id,
            run_id: row.run_id,
            status,
            signature: row.signature,
            amount: row.amount,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const REFUND_COLUMNS: &str = "id, run_id, status, signature, amount, created_at, updated_at";

#[derive(Clone)]
pub struct RefundStore {
    pool: PgPool,
}

impl RefundStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates (or returns) the pending refund for a run. A run carries at
    /// most one refund; a retry after a failed broadcast reuses the row.
    pub async fn create_pending(&self, run_id: Uuid, amount: i64) -> Result<Refund, StoreError> {
        let query = format!(
            "INSERT INTO refunds (id, run_id, status, amount) VALUES ($1, $2, 'pending', $3) \
             ON CONFLICT (run_id) DO UPDATE SET updated_at = now() \
             RETURNING {REFUND_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RefundRow>(&query)
            .bind(Uuid::new_v4())
            .bind(run_id)
            .bind(amount)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    /// Marks the refund issued and records the creator's debt toward the
    /// platform, atomically.
    pub async fn mark_issued(
        &self,
        refund_id: Uuid,
        signature: &str,
        creator_id: Uuid,
        offer_id: Uuid,
        amount: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE refunds SET status = 'issued', signature = $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(refund_id)
        .bind(signature)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT INTO creator_debts (id, creator_id, offer_id, refund_id, amount) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(creator_id)
        .bind(offer_id)
        .bind(refund_id)
        .bind(amount)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Marks the refund failed; surfaced for manual intervention.
    pub async fn mark_failed(&self, refund_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE refunds SET status = 'failed', updated_at = now() WHERE id = $1")
            .bind(refund_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_by_run(&self, run_id: Uuid) -> Result<Option<Refund>, StoreError> {
        let query = format!("SELECT {REFUND_COLUMNS} FROM refunds WHERE run_id = $1");
        let row = sqlx::query_as::<_, RefundRow>(&query)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Refund::try_from).transpose()
    }
}
