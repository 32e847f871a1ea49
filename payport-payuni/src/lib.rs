//! Stateless adapter for the PAYUNi payment gateway.
//!
//! The adapter builds sealed checkout envelopes for the browser-initiated
//! flows (one-shot and subscription), parses and verifies the envelopes the
//! gateway sends back on both return channels, and speaks the synchronous
//! JSON query/modify APIs. All payloads travel in the envelope format of
//! [`payport_common::seal`].

/// The remote-operations trait the lifecycle engine depends on.
pub mod api;
/// The HTTP client for the gateway plus envelope builders.
pub mod client;
/// Wire types: status maps, typed query records, parsed notifications.
pub mod types;

pub use api::GatewayApi;
pub use client::{PayuniClient, PayuniConfig};
