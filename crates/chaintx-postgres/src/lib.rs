//! PostgreSQL storage for chaintx.
//!
//! [`PgStore`] implements every storage trait in [`chaintx::ports`] over a
//! sqlx pool. Multi-row invariants (the per-wallet derivation counter, the
//! status transition plus its outbox event, wallet rotation) each run in a
//! single transaction; worker claims use `FOR UPDATE SKIP LOCKED` so
//! replicas never share a lease.
//!
//! # Modules
//!
//! - [`store`] pool setup, migrations, catalog reads
//! - `payment_requests` idempotent create, reads, reconciliation claims
//! - `outbox` webhook dispatch bookkeeping and operator mutations
//! - `wallet_sync` startup wallet-account reuse/rotation

// Storage
pub mod error;
pub mod store;

mod outbox;
mod payment_requests;
mod rows;
mod wallet_sync;

// Re-exports
pub use error::StoreError;
pub use store::{OutboxSettings, PgStore};
