//! HTTP surface for chaintx.
//!
//! Serves payment request create/read, the asset catalog, webhook outbox
//! operations, the OpenAPI document and Prometheus metrics. Errors render as
//! `{type, code, message, metadata?}` through [`ApiError`].
//!
//! # Modules
//!
//! - [`routes`] handlers grouped by resource, each with a `configure`
//! - [`state`] shared [`AppState`] wired from a store and [`chaintx::Config`]
//! - [`auth`] bearer checks for webhook-outbox operators
//! - [`keysetverify`] the offline keyset check behind `chaintx-keysetverify`

pub mod auth;
pub mod error;
pub mod keysetverify;
pub mod metrics;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use state::AppState;
