//! The data model: orders, users, entitlements, period payments, and the
//! compensation queue.
//!
//! All entities are identified by stable, opaque string keys. Nothing here
//! talks to a store; persistence lives behind the
//! [`OrderStore`](crate::store::OrderStore) port.

use std::fmt;

use payport_common::time::TimestampMs;
use payport_payuni::types::TradeStatus;
use serde::{Deserialize, Serialize};

// --- Orders --- //

/// Whether a product is bought once or billed per period.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductType {
    OneTime,
    Subscription,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OneTime => f.write_str("ONE_TIME"),
            Self::Subscription => f.write_str("SUBSCRIPTION"),
        }
    }
}

/// Order lifecycle state. Created in `Pending`; leaves `Pending` only via
/// the payment processor after a verified re-query.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Failed,
    Cancelled,
    Unknown,
}

impl From<TradeStatus> for OrderStatus {
    fn from(status: TradeStatus) -> Self {
        match status {
            TradeStatus::Paid => Self::Paid,
            TradeStatus::PayFailed | TradeStatus::Expired => Self::Failed,
            TradeStatus::PayCancelled => Self::Cancelled,
            TradeStatus::NumberIssued | TradeStatus::Unpaid => Self::Pending,
            TradeStatus::AwaitingConfirm | TradeStatus::Unknown(_) =>
                Self::Unknown,
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One purchase intent, keyed by `trade_no`.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Unique, <= 40 chars, `[A-Za-z0-9_-]`. Subscriptions carry a `_0`
    /// anchor suffix; later cycles use `_N`.
    pub trade_no: String,
    pub merchant_id: String,
    /// Minor currency units, > 0.
    pub amount: u64,
    pub status: OrderStatus,
    /// The gateway's display text for the last observed trade status.
    pub status_text: Option<String>,
    pub email: String,
    pub created_at: TimestampMs,
    pub completed_at: Option<TimestampMs>,
    /// The gateway-assigned sequence for a successful authorization.
    pub gateway_seq: Option<String>,
    pub product_id: String,
    pub product_name: String,
    pub product_type: ProductType,
    /// The gateway's subscription handle; only on anchor orders.
    pub period_trade_no: Option<String>,
    pub payment_method: Option<String>,
    /// Opaque audit blob (merged notify + query fields).
    pub remark: Option<String>,
}

/// A partial order update, applied by the payment processor.
/// `None` fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct OrderPatch {
    pub trade_no: String,
    pub status: Option<OrderStatus>,
    pub status_text: Option<String>,
    pub gateway_seq: Option<String>,
    pub period_trade_no: Option<String>,
    pub payment_method: Option<String>,
    pub remark: Option<String>,
    pub completed_at: Option<TimestampMs>,
}

// --- Users --- //

/// Owned by the external identity provider; the core only reads.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// The identity provider's subject.
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    pub picture: Option<String>,
    pub created_at: TimestampMs,
    pub last_login_at: TimestampMs,
}

// --- Entitlements --- //

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntitlementStatus {
    Active,
    Expired,
    Cancelled,
}

/// What a user is entitled to after a verified payment. At most one ACTIVE
/// entitlement exists per (`user_id`, `product_id`).
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub kind: ProductType,
    pub status: EntitlementStatus,
    pub start_date: TimestampMs,
    /// `None` for one-time purchases.
    pub expiry_date: Option<TimestampMs>,
    /// The most recently applied grant source.
    pub source_order_id: String,
    pub period_trade_no: Option<String>,
    pub cancelled_at: Option<TimestampMs>,
}

// --- Period payments --- //

/// One charged subscription cycle. Uniquely keyed by
/// (`period_trade_no`, `sequence_no`); written at most once.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodPayment {
    pub period_trade_no: String,
    /// The `_0` anchor order of the subscription.
    pub base_order_no: String,
    /// 0 for the anchor, then 1, 2, ...
    pub sequence_no: u32,
    pub trade_seq: String,
    pub amount: u64,
    pub status: String,
    pub paid_at: Option<String>,
    pub remark: Option<String>,
}

// --- Compensation --- //

/// A recorded intent to retry entitlement granting out-of-band after the
/// synchronous attempts have exhausted.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompensationTask {
    pub trade_no: String,
    pub amount: u64,
    pub reason: String,
    pub attempt: u32,
    pub enqueued_at: TimestampMs,
}

// --- Trade number helpers --- //

/// Strip a trailing `_N` cycle suffix, if any. Trade numbers themselves are
/// `[A-Za-z0-9]{20}`, so an underscore can only introduce a suffix.
pub fn base_trade_no(trade_no: &str) -> &str {
    match trade_no.rsplit_once('_') {
        Some((base, suffix))
            if !suffix.is_empty()
                && suffix.bytes().all(|b| b.is_ascii_digit()) =>
            base,
        _ => trade_no,
    }
}

/// The `_0` anchor order id for a (possibly cycle-suffixed) trade number.
pub fn anchor_trade_no(trade_no: &str) -> String {
    format!("{}_0", base_trade_no(trade_no))
}

/// The cycle sequence of a trade number: `N` of a trailing `_N`, else 0.
pub fn cycle_sequence(trade_no: &str) -> u32 {
    match trade_no.rsplit_once('_') {
        Some((_, suffix)) => suffix.parse().unwrap_or(0),
        None => 0,
    }
}
