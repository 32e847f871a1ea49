//! The order store port.
//!
//! The engine persists through this capability set and nothing else. A
//! backing adapter may be a spreadsheet, an RDBMS, or a KV store; it need
//! not offer transactions. The engine never assumes multi-row atomicity and
//! leans on idempotent row-level operations instead.

use async_trait::async_trait;
use payport_common::time::TimestampMs;

use crate::catalog::Product;
use crate::error::Error;
use crate::models::{
    CompensationTask, Entitlement, Order, OrderPatch, PeriodPayment, User,
};

/// In-memory reference implementation.
pub mod memory;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// The most recent PENDING order for (`email`, `product_id`), if any.
    async fn find_pending_order(
        &self,
        email: &str,
        product_id: &str,
    ) -> Result<Option<Order>, Error>;

    async fn create_order(&self, order: &Order) -> Result<(), Error>;

    /// Apply a partial update to an existing order row.
    async fn update_order(&self, patch: &OrderPatch) -> Result<(), Error>;

    async fn get_order_by_trade_no(
        &self,
        trade_no: &str,
    ) -> Result<Option<Order>, Error>;

    /// All of a user's orders, newest first.
    async fn list_user_orders(&self, email: &str)
        -> Result<Vec<Order>, Error>;

    async fn find_user(&self, id: &str) -> Result<Option<User>, Error>;

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>, Error>;

    async fn create_user(&self, user: &User) -> Result<(), Error>;

    async fn update_user_login(
        &self,
        id: &str,
        at: TimestampMs,
    ) -> Result<(), Error>;

    /// A user's entitlements with status derived on read
    /// (ACTIVE past its expiry reads as EXPIRED).
    async fn get_user_entitlements(
        &self,
        user_id: &str,
    ) -> Result<Vec<Entitlement>, Error>;

    /// Apply a verified payment to a user's entitlement for `product`.
    ///
    /// - One-time products upsert an ACTIVE entitlement with no expiry.
    /// - Subscriptions extend the expiry by the product's period length,
    ///   from the later of now and the current expiry.
    ///
    /// Idempotent on `source_order_id`: re-applying an already-applied
    /// source is a no-op. At most one ACTIVE entitlement ever exists per
    /// (`user_id`, `product_id`).
    async fn grant_entitlement(
        &self,
        user_id: &str,
        product: &Product,
        source_order_id: &str,
    ) -> Result<(), Error>;

    /// Mark a user's subscription entitlement cancelled and return it.
    async fn cancel_subscription(
        &self,
        user_id: &str,
        period_trade_no: &str,
    ) -> Result<Entitlement, Error>;

    /// Record one charged subscription cycle. Idempotent on the composite
    /// key (`period_trade_no`, `sequence_no`); duplicates are dropped.
    async fn record_period_payment(
        &self,
        row: &PeriodPayment,
    ) -> Result<(), Error>;

    /// Record an exhausted entitlement grant for out-of-band repair.
    async fn record_failed_entitlement(
        &self,
        task: &CompensationTask,
    ) -> Result<(), Error>;
}
