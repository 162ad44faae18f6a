//! Background workers for chaintx.
//!
//! Each binary loads [`chaintx::Config`], runs the shared startup sequence
//! against PostgreSQL, then drives one job on an interval until SIGINT or
//! SIGTERM:
//!
//! - `chaintx-reconciler` observes open payment requests on chain
//!   ([`observers`]) and moves them through their statuses
//! - `chaintx-webhook-dispatcher` delivers outbox events ([`webhook`])
//! - `chaintx-webhook-alerts` watches outbox health ([`alerts`])

// Chain and HTTP adapters
pub mod alerts;
pub mod observers;
pub mod webhook;

// Runtime
pub mod jobs;
pub mod runner;
pub mod startup;
pub mod telemetry;

// Re-exports
pub use alerts::TracingAlertSink;
pub use jobs::{AlertJob, DispatchJob, ReconcileJob};
pub use observers::ObserverRouter;
pub use runner::{cancel_on_shutdown, run_every, shutdown_signal};
pub use startup::{start, WorkerRuntime};
pub use webhook::{http_client, HttpWebhookGateway};
