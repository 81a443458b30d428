//! Durable storage: offers, runs, refunds, creator debts, reward claims.
//!
//! Everything here is PostgreSQL behind `sqlx`. Cross-table writes that must
//! be atomic (paying a run, executing a run and bumping the offer counter,
//! issuing a refund and recording the creator debt) run inside a single
//! transaction; per-row races are resolved with `SELECT ... FOR UPDATE` and
//! the unique constraints on `reference` and `signature`.

pub mod claim;
pub mod offer;
pub mod refund;
pub mod run;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use claim::ClaimStore;
pub use offer::{InputField, Offer, OfferHealth, OfferMode, OfferStatus, OfferStore};
pub use refund::{Refund, RefundStatus, RefundStore};
pub use run::{Run, RunStatus, RunStore};

/// Errors surfaced by the stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The reference is already taken. Duplicate references are a client
    /// bug, not a retry; the caller gets the error verbatim.
    #[error("Reference already exists")]
    DuplicateReference,
    /// The payment signature is already recorded against another run.
    #[error("Payment signature already used by another run")]
    SignatureInUse,
    #[error("Run not found")]
    RunNotFound,
    /// A claim row for `(offer, wallet, reference)` already exists.
    #[error("Reward already claimed for this reference")]
    DuplicateClaim,
    /// The run is not in a state that permits the requested transition.
    #[error("Invalid run state: {0}")]
    InvalidTransition(RunStatus),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A row violated an invariant the schema cannot express (for example an
    /// unknown status string). Only reachable if the database was edited
    /// outside the application.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Maps a sqlx error to a domain error when the unique constraint that
    /// fired is recognized.
    pub(crate) fn from_sqlx(error: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &error {
            match db.constraint() {
                Some("runs_reference_key") => return StoreError::DuplicateReference,
                Some("runs_signature_key") => return StoreError::SignatureInUse,
                Some("reward_claims_unique") => return StoreError::DuplicateClaim,
                _ => {}
            }
        }
        StoreError::Database(error)
    }
}

/// Connects a pool and applies pending migrations.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    Ok(pool)
}
