//! Crypto payment requests with HD address allocation.
//!
//! A merchant creates a payment request; the service derives a fresh deposit
//! address from an account-level extended public key, watches the chain for
//! funds, and reports status changes to the merchant's webhook.
//!
//! # Moving parts
//!
//! - **Allocation** ([`PaymentRequestService`]) idempotent create backed by a
//!   per-wallet derivation counter
//! - **Reconciliation** ([`Reconciler`]) lease-based scans that move requests
//!   through `pending → detected → confirmed | expired`
//! - **Outbox** ([`Dispatcher`], [`WebhookOutboxOps`]) signed at-least-once
//!   delivery with retry, dead-lettering and operator requeue/cancel
//! - **Alerts** ([`AlertMonitor`]) threshold alerts over outbox health
//!
//! Storage, chain access and HTTP delivery sit behind the traits in
//! [`ports`]. `chaintx-postgres` provides the production store; the
//! [`InMemoryStore`] serves tests.

// Shared kernel
pub mod canonical_json;
pub mod clock;
pub mod config;
pub mod domain;
pub mod error;
pub mod hmac;
pub mod ports;
pub mod security;
pub mod validation;

// Keys and addresses
pub mod address;
pub mod keys;
pub mod wallet;

// Use cases
pub mod alerts;
pub mod bootstrap;
pub mod catalog;
pub mod dispatch;
pub mod outbox;
pub mod outbox_ops;
pub mod payment_requests;
pub mod reconcile;
pub mod threshold;
pub mod wallet_sync;

// Storage
pub mod memory;

// Re-exports
pub use alerts::{AlertMonitor, AlertThresholds, WebhookAlert};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{Config, ConfigError};
pub use dispatch::Dispatcher;
pub use domain::*;
pub use error::{AppError, AppResult, ErrorKind};
pub use memory::InMemoryStore;
pub use outbox_ops::WebhookOutboxOps;
pub use payment_requests::PaymentRequestService;
pub use reconcile::Reconciler;
pub use threshold::ThresholdPolicy;
pub use wallet::{AllocationMode, WalletAllocator};
