//! The `payport-common` crate contains utilities shared between the payport
//! gateway adapter, lifecycle engine, and server code.

/// Exponential backoff.
pub mod backoff;
/// Hex utils.
pub mod hex;
/// Random number generation.
pub mod rng;
/// The sealed-envelope codec used on the gateway wire.
pub mod seal;
/// `ShutdownChannel`.
pub mod shutdown;
/// `TimestampMs`.
pub mod time;
