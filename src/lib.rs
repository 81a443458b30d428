//! blink402 — a payment-gated HTTP proxy on Solana.
//!
//! The proxy turns arbitrary upstream HTTP endpoints into per-call priced
//! resources ("offers"). A client without proof of payment receives an HTTP
//! `402 Payment Required` response carrying the payment terms; once the
//! payment settles on-chain the proxy forwards the original request to the
//! offer's upstream and relays the response. Offers can also run in the
//! inverse *reward* direction: the upstream validates that the caller
//! completed some action and the proxy pays the caller from a funded
//! wallet.
//!
//! # Modules
//!
//! - [`chain`] — Solana types (addresses, references, tokens) and the RPC
//!   provider for verification and outbound transfers.
//! - [`config`] — environment-backed configuration, including validated
//!   keypair secrets.
//! - [`challenge`] — single-use signed challenges gating reward claims.
//! - [`error`] — the proxy's error surface and its HTTP mapping.
//! - [`guard`] — static URL policy for outbound dispatch.
//! - [`kv`] — the key-value store: distributed mutex, idempotent response
//!   cache, offer cache, challenges, rate counters.
//! - [`payment`] — payment verification: facilitator envelope, trusted
//!   tx-hash, and on-chain reference scan strategies.
//! - [`proxy`] — the orchestrator composing everything behind
//!   `POST /{slug}`.
//! - [`refund`] — automatic refunds and the creator-debt ledger.
//! - [`retry`] — named retry policies for remote calls.
//! - [`reward`] — reward disbursement from funded wallets.
//! - [`store`] — durable storage: offers, runs, refunds, claims.
//! - [`upstream`] — bounded upstream dispatch with the per-offer circuit
//!   breaker.

pub mod chain;
pub mod challenge;
pub mod config;
pub mod error;
pub mod guard;
pub mod kv;
pub mod payment;
pub mod proxy;
pub mod refund;
pub mod retry;
pub mod reward;
pub mod store;
pub mod telemetry;
pub mod upstream;
