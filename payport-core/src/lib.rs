//! The payment lifecycle engine.
//!
//! This crate owns everything between the HTTP surface and the gateway
//! adapter: order de-duplication and creation, the trust-but-verify webhook
//! state machine, the entitlement-granting payment processor with bounded
//! retry and compensation, the order store port, and the single-use result
//! token cache.

/// The product catalog.
pub mod catalog;
/// Error taxonomy: kinds tagged with (retryable, http-status).
pub mod error;
/// The data model: orders, users, entitlements, period payments.
pub mod models;
/// Order de-duplication and creation.
pub mod order_service;
/// The payment processor: order update, entitlement grant, period rows.
pub mod processor;
/// The order store port and its in-memory reference implementation.
pub mod store;
/// Short-TTL single-use result tokens for the browser return channel.
pub mod token_cache;
/// The webhook protocol state machine.
pub mod webhook;

/// Feature-gated test fixtures shared across crate boundaries.
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use error::{Error, ErrorKind};
