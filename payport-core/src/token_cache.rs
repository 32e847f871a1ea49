//! Short-TTL single-use result tokens for the browser return channel.
//!
//! The `/payment-return` handler stores an immutable result snapshot here
//! and redirects the browser with an opaque token; the result page then
//! reads the snapshot through the API exactly once. Nothing in a snapshot
//! identifies a person beyond order identifiers and an amount.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use payport_common::hex;
use payport_common::rng::{RngExt, SysRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Error, ErrorKind};

/// How long a snapshot stays retrievable.
pub const RESULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Hard ceiling on live entries; inserts beyond it are rejected.
const DEFAULT_CAPACITY: usize = 4096;

/// What the browser return channel observed, frozen at return time.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSnapshot {
    /// `success` or `fail`.
    pub status: String,
    pub trade_no: String,
    pub trade_seq: Option<String>,
    pub amount: Option<u64>,
    pub paid_at: Option<String>,
    pub message: Option<String>,
}

struct Entry {
    inserted_at: Instant,
    snapshot: ResultSnapshot,
}

/// Single-use mapping from opaque token to result snapshot.
///
/// Internally synchronized; `put`/`take` are linearizable. Expiry is lazy:
/// stale entries are dropped on insert and never returned on read.
pub struct ResultTokenCache {
    inner: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
    capacity: usize,
}

impl Default for ResultTokenCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ResultTokenCache {
    pub fn new() -> Self {
        Self::with_config(RESULT_TOKEN_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_config(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Insert a snapshot and mint its token: 32 random bytes, hex-encoded.
    pub fn put(&self, snapshot: ResultSnapshot) -> Result<String, Error> {
        let token = hex::encode(&SysRng::new().gen_bytes::<32>());
        let now = Instant::now();

        let mut inner = self.inner.lock().expect("token cache poisoned");
        inner.retain(|_, entry| now - entry.inserted_at < self.ttl);
        if inner.len() >= self.capacity {
            return Err(Error::new(
                ErrorKind::ServiceUnavailable,
                "result token cache full",
            ));
        }
        inner.insert(
            token.clone(),
            Entry {
                inserted_at: now,
                snapshot,
            },
        );
        Ok(token)
    }

    /// Atomically remove and return the snapshot for `token`.
    /// Returns `None` for unknown, already-taken, or expired tokens.
    pub fn take(&self, token: &str) -> Option<ResultSnapshot> {
        let now = Instant::now();
        let mut inner = self.inner.lock().expect("token cache poisoned");
        let entry = inner.remove(token)?;
        (now - entry.inserted_at < self.ttl).then_some(entry.snapshot)
    }
}
