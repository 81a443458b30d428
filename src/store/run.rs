//! Run rows: the per-payment state machine.
//!
//! A run advances `pending → paid → executed`, or drops to `failed` from any
//! state. The single permitted reversal is `failed → paid` for a run whose
//! payment was verified before execution failed; that keeps the payment
//! usable for an upstream retry without ever re-verifying it.
//!
//! Transition writes take a row lock (`FOR UPDATE`); the `reference` and
//! `signature` unique constraints are the double-spend backstop even when
//! the distributed mutex degrades.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::PgPool;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

use crate::store::StoreError;

/// Minutes a pending run stays payable before it is read-failed.
pub const RUN_TTL_MINUTES: i64 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Paid,
    Executed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Paid => "paid",
            RunStatus::Executed => "executed",
            RunStatus::Failed => "failed",
        }
    }
}

impl Display for RunStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "paid" => Ok(RunStatus::Paid),
            "executed" => Ok(RunStatus::Executed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("Unknown run status: {other}")),
        }
    }
}

/// One execution attempt against an offer, keyed by its reference.
#[derive(Clone, Debug)]
pub struct Run {
    pub id: Uuid,
    pub offer_id: Uuid,
    pub reference: String,
    pub signature: Option<String>,
    pub payer: Option<String>,
    pub status: RunStatus,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl Run {
    /// A run whose payment settled has both a signature and a payer; the
    /// refund path and the failed-to-paid revival require both.
    pub fn payment_verified(&self) -> bool {
        self.signature.is_some() && self.payer.is_some()
    }

    /// The upstream response recorded at execution time, if any.
    pub fn recorded_response(&self) -> Option<&JsonValue> {
        self.metadata.get("response")
    }
}

#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    offer_id: Uuid,
    reference: String,
    signature: Option<String>,
    payer: Option<String>,
    status: String,
    metadata: JsonValue,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    paid_at: Option<DateTime<Utc>>,
    executed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl TryFrom<RunRow> for Run {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| StoreError::Corrupt(e))?;
        Ok(Run {
            id: row.id,
            offer_id: row.offer_id,
            reference: row.reference,
            signature: row.signature,
            payer: row.payer,
            status,
            metadata: row.metadata,
            created_at: row.created_at,
            expires_at: row.expires_at,
            paid_at: row.paid_at,
            executed_at: row.executed_at,
            duration_ms: row.duration_ms,
        })
    }
}

const RUN_COLUMNS: &str = "id, offer_id, reference, signature, payer, status, metadata, \
     created_at, expires_at, paid_at, executed_at, duration_ms";

/// State-machine operations over run rows.
#[derive(Clone)]
pub struct RunStore {
    pool: PgPool,
}

impl RunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts a fresh pending run. Fails with
    /// [`StoreError::DuplicateReference`] if the reference is taken.
    pub async fn create_run(
        &self,
        offer_id: Uuid,
        reference: &str,
        metadata: JsonValue,
    ) -> Result<Run, StoreError> {
        let query = format!(
            "INSERT INTO runs (id, offer_id, reference, status, metadata, expires_at) \
             VALUES ($1, $2, $3, 'pending', $4, now() + make_interval(mins => $5)) \
             RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(Uuid::new_v4())
            .bind(offer_id)
            .bind(reference)
            .bind(metadata)
            .bind(RUN_TTL_MINUTES as i32)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        row.try_into()
    }

    /// Fetches a run by reference. A pending run past its expiry is
    /// atomically failed first, so callers never observe a payable run that
    /// can no longer be paid.
    pub async fn get_by_reference(&self, reference: &str) -> Result<Option<Run>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE runs SET status = 'failed' \
             WHERE reference = $1 AND status = 'pending' AND expires_at < now()",
        )
        .bind(reference)
        .execute(&mut *tx)
        .await?;
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE reference = $1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.map(Run::try_from).transpose()
    }

    pub async fn get_by_signature(&self, signature: &str) -> Result<Option<Run>, StoreError> {
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE signature = $1");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(signature)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Run::try_from).transpose()
    }

    /// Transitions `pending → paid` under a row lock.
    ///
    /// Fails if the run is not pending, or if the signature already belongs
    /// to a different reference. Exactly one concurrent caller can win this
    /// transition; losers observe [`StoreError::InvalidTransition`] and must
    /// treat the stored `(signature, payer)` as authoritative.
    pub async fn update_payment_atomic(
        &self,
        reference: &str,
        signature: &str,
        payer: Option<&str>,
    ) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await?;
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE reference = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::RunNotFound)?;
        let current: Run = row.try_into()?;
        if current.status != RunStatus::Pending {
            return Err(StoreError::InvalidTransition(current.status));
        }
        let clash: Option<(String,)> =
            sqlx::query_as("SELECT reference FROM runs WHERE signature = $1 AND reference <> $2")
                .bind(signature)
                .bind(reference)
                .fetch_optional(&mut *tx)
                .await?;
        if clash.is_some() {
            return Err(StoreError::SignatureInUse);
        }
        let query = format!(
            "UPDATE runs SET status = 'paid', signature = $2, payer = $3, paid_at = now() \
             WHERE reference = $1 RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(reference)
            .bind(signature)
            .bind(payer)
            .fetch_one(&mut *tx)
            .await
            .map_err(StoreError::from_sqlx)?;
        tx.commit().await?;
        row.try_into()
    }

    /// Transitions `paid → executed`, bumps the offer's run counter, and
    /// merges the upstream response into the metadata under a `response`
    /// key, leaving the captured inputs untouched. One transaction: the
    /// counter increments exactly once per executed run.
    pub async fn mark_executed(
        &self,
        reference: &str,
        duration_ms: i64,
        response_data: &JsonValue,
    ) -> Result<Run, StoreError> {
        let mut tx = self.pool.begin().await?;
        let query = format!("SELECT {RUN_COLUMNS} FROM runs WHERE reference = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(reference)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::RunNotFound)?;
        let current: Run = row.try_into()?;
        if current.status != RunStatus::Paid {
            return Err(StoreError::InvalidTransition(current.status));
        }
        let query = format!(
            "UPDATE runs SET status = 'executed', executed_at = now(), duration_ms = $2, \
             metadata = metadata || jsonb_build_object('response', $3::jsonb) \
             WHERE reference = $1 RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(reference)
            .bind(duration_ms)
            .bind(response_data)
            .fetch_one(&mut *tx)
            .await?;
        sqlx::query("UPDATE offers SET run_count = run_count + 1 WHERE id = $1")
            .bind(current.offer_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        row.try_into()
    }

    /// Drops a run to `failed` from any state.
    pub async fn mark_failed(&self, reference: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE runs SET status = 'failed' WHERE reference = $1")
            .bind(reference)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Revives a failed run whose payment was verified back to `paid` so
    /// the upstream call can be retried. Returns the revived run, or `None`
    /// when the run does not qualify.
    pub async fn revive(&self, reference: &str) -> Result<Option<Run>, StoreError> {
        let query = format!(
            "UPDATE runs SET status = 'paid' \
             WHERE reference = $1 AND status = 'failed' \
               AND signature IS NOT NULL AND payer IS NOT NULL \
             RETURNING {RUN_COLUMNS}"
        );
        let row = sqlx::query_as::<_, RunRow>(&query)
            .bind(reference)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Run::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_with(status: RunStatus, signature: Option<&str>, payer: Option<&str>) -> Run {
        Run {
            id: Uuid::new_v4(),
            offer_id: Uuid::new_v4(),
            reference: "ref".into(),
            signature: signature.map(String::from),
            payer: payer.map(String::from),
            status,
            metadata: serde_json::json!({"city": "Lisbon"}),
            created_at: Utc::now(),
            expires_at: Utc::now(),
            paid_at: None,
            executed_at: None,
            duration_ms: None,
        }
    }

    #[test]
    fn payment_verified_needs_both_fields() {
        assert!(!run_with(RunStatus::Paid, Some("sig"), None).payment_verified());
        assert!(!run_with(RunStatus::Paid, None, Some("payer")).payment_verified());
        assert!(run_with(RunStatus::Paid, Some("sig"), Some("payer")).payment_verified());
    }

    #[test]
    fn recorded_response_reads_metadata() {
        let mut run = run_with(RunStatus::Executed, Some("sig"), Some("payer"));
        assert!(run.recorded_response().is_none());
        run.metadata = serde_json::json!({"city": "Lisbon", "response": {"sum": 3}});
        assert_eq!(
            run.recorded_response(),
            Some(&serde_json::json!({"sum": 3}))
        );
    }

    #[test]
    fn status_round_trips() {
        for status in [
            RunStatus::Pending,
            RunStatus::Paid,
            RunStatus::Executed,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
    }
}
