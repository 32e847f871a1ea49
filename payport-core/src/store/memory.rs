//! An in-memory [`OrderStore`], the reference implementation of the port.
//!
//! Used by the test suite and as the default engine of the server binary
//! when no external adapter is wired up. All invariants the port documents
//! (grant idempotence, one ACTIVE entitlement per user/product, composite
//! period-payment keys) live here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use payport_common::time::TimestampMs;

use crate::catalog::Product;
use crate::error::{Error, ErrorKind};
use crate::models::{
    anchor_trade_no, CompensationTask, Entitlement, EntitlementStatus, Order,
    OrderPatch, OrderStatus, PeriodPayment, ProductType, User,
};
use crate::store::OrderStore;

#[derive(Default)]
struct Inner {
    /// Orders by trade number.
    orders: HashMap<String, Order>,
    /// Users by identity-provider subject.
    users: HashMap<String, User>,
    entitlements: Vec<Entitlement>,
    /// Every applied grant, keyed (user, product, source). The dedup set
    /// behind grant idempotence.
    applied_grants: HashSet<(String, String, String)>,
    /// Cycle rows by composite key.
    period_payments: BTreeMap<(String, u32), PeriodPayment>,
    compensation: Vec<CompensationTask>,
    next_entitlement_id: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("MemoryStore mutex poisoned")
    }

    /// All recorded compensation tasks. Read by the out-of-band repair job
    /// and by tests.
    pub fn compensation_tasks(&self) -> Vec<CompensationTask> {
        self.lock().compensation.clone()
    }

    /// All recorded cycle rows, in key order. For tests and audits.
    pub fn period_payment_rows(&self) -> Vec<PeriodPayment> {
        self.lock().period_payments.values().cloned().collect()
    }
}

impl Inner {
    fn entitlement_index(
        &self,
        user_id: &str,
        product_id: &str,
    ) -> Option<usize> {
        self.entitlements
            .iter()
            .position(|e| e.user_id == user_id && e.product_id == product_id)
    }

    fn next_entitlement_id(&mut self) -> String {
        self.next_entitlement_id += 1;
        format!("ent-{:04}", self.next_entitlement_id)
    }
}

/// Derive the externally visible status: an ACTIVE entitlement past its
/// expiry reads as EXPIRED.
fn derived(mut ent: Entitlement, now: TimestampMs) -> Entitlement {
    if ent.status == EntitlementStatus::Active {
        if let Some(expiry) = ent.expiry_date {
            if expiry < now {
                ent.status = EntitlementStatus::Expired;
            }
        }
    }
    ent
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn find_pending_order(
        &self,
        email: &str,
        product_id: &str,
    ) -> Result<Option<Order>, Error> {
        let inner = self.lock();
        let found = inner
            .orders
            .values()
            .filter(|order| {
                order.status == OrderStatus::Pending
                    && order.email == email
                    && order.product_id == product_id
            })
            .max_by_key(|order| order.created_at)
            .cloned();
        Ok(found)
    }

    async fn create_order(&self, order: &Order) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.orders.contains_key(&order.trade_no) {
            return Err(Error::internal(format!(
                "duplicate trade number {}",
                order.trade_no
            )));
        }
        inner.orders.insert(order.trade_no.clone(), order.clone());
        Ok(())
    }

    async fn update_order(&self, patch: &OrderPatch) -> Result<(), Error> {
        let mut inner = self.lock();
        let order = inner.orders.get_mut(&patch.trade_no).ok_or_else(|| {
            Error::not_found(format!("no order {}", patch.trade_no))
        })?;

        if let Some(status) = patch.status {
            order.status = status;
        }
        if let Some(status_text) = &patch.status_text {
            order.status_text = Some(status_text.clone());
        }
        if let Some(gateway_seq) = &patch.gateway_seq {
            order.gateway_seq = Some(gateway_seq.clone());
        }
        if let Some(period_trade_no) = &patch.period_trade_no {
            order.period_trade_no = Some(period_trade_no.clone());
        }
        if let Some(payment_method) = &patch.payment_method {
            order.payment_method = Some(payment_method.clone());
        }
        if let Some(remark) = &patch.remark {
            order.remark = Some(remark.clone());
        }
        if let Some(completed_at) = patch.completed_at {
            order.completed_at = Some(completed_at);
        }
        Ok(())
    }

    async fn get_order_by_trade_no(
        &self,
        trade_no: &str,
    ) -> Result<Option<Order>, Error> {
        Ok(self.lock().orders.get(trade_no).cloned())
    }

    async fn list_user_orders(
        &self,
        email: &str,
    ) -> Result<Vec<Order>, Error> {
        let inner = self.lock();
        let mut orders = inner
            .orders
            .values()
            .filter(|order| order.email == email)
            .cloned()
            .collect::<Vec<_>>();
        // Newest first; trade number as a stable tie-break.
        orders.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.trade_no.cmp(&b.trade_no))
        });
        Ok(orders)
    }

    async fn find_user(&self, id: &str) -> Result<Option<User>, Error> {
        Ok(self.lock().users.get(id).cloned())
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<User>, Error> {
        let inner = self.lock();
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn create_user(&self, user: &User) -> Result<(), Error> {
        self.lock().users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    async fn update_user_login(
        &self,
        id: &str,
        at: TimestampMs,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let user = inner
            .users
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("no user {id}")))?;
        user.last_login_at = at;
        Ok(())
    }

    async fn get_user_entitlements(
        &self,
        user_id: &str,
    ) -> Result<Vec<Entitlement>, Error> {
        let now = TimestampMs::now();
        let inner = self.lock();
        Ok(inner
            .entitlements
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| derived(e.clone(), now))
            .collect())
    }

    async fn grant_entitlement(
        &self,
        user_id: &str,
        product: &Product,
        source_order_id: &str,
    ) -> Result<(), Error> {
        let mut inner = self.lock();

        let grant_key = (
            user_id.to_owned(),
            product.id.clone(),
            source_order_id.to_owned(),
        );
        if inner.applied_grants.contains(&grant_key) {
            return Ok(());
        }

        let now = TimestampMs::now();
        match product.kind {
            ProductType::OneTime => {
                match inner.entitlement_index(user_id, &product.id) {
                    Some(idx) => {
                        let ent = &mut inner.entitlements[idx];
                        ent.status = EntitlementStatus::Active;
                        ent.expiry_date = None;
                        ent.source_order_id = source_order_id.to_owned();
                        ent.cancelled_at = None;
                    }
                    None => {
                        let id = inner.next_entitlement_id();
                        inner.entitlements.push(Entitlement {
                            id,
                            user_id: user_id.to_owned(),
                            product_id: product.id.clone(),
                            kind: ProductType::OneTime,
                            status: EntitlementStatus::Active,
                            start_date: now,
                            expiry_date: None,
                            source_order_id: source_order_id.to_owned(),
                            period_trade_no: None,
                            cancelled_at: None,
                        });
                    }
                }
            }
            ProductType::Subscription => {
                let length = product.period_length().ok_or_else(|| {
                    Error::new(
                        ErrorKind::BadProduct,
                        format!("product {} lacks period config", product.id),
                    )
                })?;
                // The anchor order carries the durable subscription handle.
                let period_trade_no = inner
                    .orders
                    .get(&anchor_trade_no(source_order_id))
                    .and_then(|order| order.period_trade_no.clone());

                match inner.entitlement_index(user_id, &product.id) {
                    Some(idx) => {
                        let ent = &mut inner.entitlements[idx];
                        // Extend from the later of now and the current
                        // expiry, so early charges don't shorten access.
                        let base = match ent.expiry_date {
                            Some(expiry) if expiry > now => expiry,
                            _ => now,
                        };
                        ent.status = EntitlementStatus::Active;
                        ent.expiry_date = Some(base.saturating_add(length));
                        ent.source_order_id = source_order_id.to_owned();
                        ent.cancelled_at = None;
                        if period_trade_no.is_some() {
                            ent.period_trade_no = period_trade_no;
                        }
                    }
                    None => {
                        let id = inner.next_entitlement_id();
                        inner.entitlements.push(Entitlement {
                            id,
                            user_id: user_id.to_owned(),
                            product_id: product.id.clone(),
                            kind: ProductType::Subscription,
                            status: EntitlementStatus::Active,
                            start_date: now,
                            expiry_date: Some(now.saturating_add(length)),
                            source_order_id: source_order_id.to_owned(),
                            period_trade_no,
                            cancelled_at: None,
                        });
                    }
                }
            }
        }

        inner.applied_grants.insert(grant_key);
        Ok(())
    }

    async fn cancel_subscription(
        &self,
        user_id: &str,
        period_trade_no: &str,
    ) -> Result<Entitlement, Error> {
        let mut inner = self.lock();
        let ent = inner
            .entitlements
            .iter_mut()
            .find(|e| {
                e.user_id == user_id
                    && e.kind == ProductType::Subscription
                    && e.period_trade_no.as_deref() == Some(period_trade_no)
            })
            .ok_or_else(|| {
                Error::not_found(format!(
                    "no subscription {period_trade_no} for user {user_id}"
                ))
            })?;

        ent.status = EntitlementStatus::Cancelled;
        ent.cancelled_at = Some(TimestampMs::now());
        Ok(ent.clone())
    }

    async fn record_period_payment(
        &self,
        row: &PeriodPayment,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        let key = (row.period_trade_no.clone(), row.sequence_no);
        // Idempotent on the composite key; duplicates are dropped.
        inner.period_payments.entry(key).or_insert_with(|| row.clone());
        Ok(())
    }

    async fn record_failed_entitlement(
        &self,
        task: &CompensationTask,
    ) -> Result<(), Error> {
        self.lock().compensation.push(task.clone());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::catalog::Catalog;

    fn order(trade_no: &str, product_id: &str, email: &str) -> Order {
        Order {
            trade_no: trade_no.to_owned(),
            merchant_id: "MER123".to_owned(),
            amount: 299,
            status: OrderStatus::Pending,
            status_text: None,
            email: email.to_owned(),
            created_at: TimestampMs::now(),
            completed_at: None,
            gateway_seq: None,
            product_id: product_id.to_owned(),
            product_name: product_id.to_owned(),
            product_type: ProductType::Subscription,
            period_trade_no: None,
            payment_method: None,
            remark: None,
        }
    }

    fn user(id: &str, email: &str) -> User {
        User {
            id: id.to_owned(),
            email: email.to_owned(),
            name: None,
            picture: None,
            created_at: TimestampMs::now(),
            last_login_at: TimestampMs::now(),
        }
    }

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    #[tokio::test]
    async fn one_time_grant_is_idempotent_on_source() {
        let store = MemoryStore::new();
        let catalog = Catalog::sample();
        let product = catalog.get("P001").unwrap();

        store.grant_entitlement("u1", product, "TRADE1").await.unwrap();
        store.grant_entitlement("u1", product, "TRADE1").await.unwrap();

        let ents = store.get_user_entitlements("u1").await.unwrap();
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].status, EntitlementStatus::Active);
        assert_eq!(ents[0].expiry_date, None);
        assert_eq!(ents[0].source_order_id, "TRADE1");
    }

    #[tokio::test]
    async fn subscription_extension_compounds_from_previous_expiry() {
        let store = MemoryStore::new();
        let catalog = Catalog::sample();
        let product = catalog.get("plan_basic").unwrap();

        // Anchor order carries the subscription handle.
        let mut anchor = order("BASE_0", "plan_basic", "bob@example.com");
        anchor.period_trade_no = Some("PTN-X".to_owned());
        store.create_order(&anchor).await.unwrap();

        let before = TimestampMs::now();
        store.grant_entitlement("u2", product, "BASE_0").await.unwrap();
        let first_expiry = store.get_user_entitlements("u2").await.unwrap()[0]
            .expiry_date
            .unwrap();
        assert!(first_expiry.as_i64() >= before.as_i64() + 32 * DAY_MS);
        assert!(
            first_expiry.as_i64()
                <= TimestampMs::now().as_i64() + 32 * DAY_MS + 1000
        );

        // Cycle 2 extends from the previous expiry, not from now.
        store.grant_entitlement("u2", product, "BASE_1").await.unwrap();
        let ents = store.get_user_entitlements("u2").await.unwrap();
        assert_eq!(ents.len(), 1);
        let second_expiry = ents[0].expiry_date.unwrap();
        assert_eq!(
            second_expiry.as_i64(),
            first_expiry.as_i64() + 32 * DAY_MS
        );
        assert_eq!(ents[0].period_trade_no.as_deref(), Some("PTN-X"));

        // Replaying an applied cycle is a no-op.
        store.grant_entitlement("u2", product, "BASE_1").await.unwrap();
        let replayed = store.get_user_entitlements("u2").await.unwrap();
        assert_eq!(replayed[0].expiry_date.unwrap(), second_expiry);
    }

    #[tokio::test]
    async fn active_entitlement_past_expiry_reads_expired() {
        let store = MemoryStore::new();
        let catalog = Catalog::sample();
        let product = catalog.get("plan_basic").unwrap();

        store.grant_entitlement("u3", product, "OLD_0").await.unwrap();
        {
            // Backdate the expiry to simulate a lapsed subscription.
            let mut inner = store.lock();
            inner.entitlements[0].expiry_date = TimestampMs::from_i64(1_000);
        }

        let ents = store.get_user_entitlements("u3").await.unwrap();
        assert_eq!(ents[0].status, EntitlementStatus::Expired);
    }

    #[tokio::test]
    async fn cancel_subscription_by_period_handle() {
        let store = MemoryStore::new();
        let catalog = Catalog::sample();
        let product = catalog.get("plan_basic").unwrap();

        let mut anchor = order("CXL_0", "plan_basic", "eve@example.com");
        anchor.period_trade_no = Some("PTN-C".to_owned());
        store.create_order(&anchor).await.unwrap();
        store.grant_entitlement("u4", product, "CXL_0").await.unwrap();

        let cancelled =
            store.cancel_subscription("u4", "PTN-C").await.unwrap();
        assert_eq!(cancelled.status, EntitlementStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());

        let err = store.cancel_subscription("u4", "PTN-??").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn period_rows_are_written_at_most_once() {
        let store = MemoryStore::new();
        let row = PeriodPayment {
            period_trade_no: "PTN-X".to_owned(),
            base_order_no: "BASE_0".to_owned(),
            sequence_no: 1,
            trade_seq: "S1".to_owned(),
            amount: 299,
            status: "已付款".to_owned(),
            paid_at: None,
            remark: None,
        };
        store.record_period_payment(&row).await.unwrap();

        let mut dup = row.clone();
        dup.trade_seq = "S2".to_owned();
        store.record_period_payment(&dup).await.unwrap();

        let rows = store.period_payment_rows();
        assert_eq!(rows.len(), 1);
        // First write wins.
        assert_eq!(rows[0].trade_seq, "S1");
    }

    #[tokio::test]
    async fn user_orders_list_newest_first() {
        let store = MemoryStore::new();
        let mut older = order("OLDER0000000000000A", "P001", "a@b.c");
        older.created_at = TimestampMs::from_i64(1_000).unwrap();
        let mut newer = order("NEWER0000000000000A", "P001", "a@b.c");
        newer.created_at = TimestampMs::from_i64(2_000).unwrap();
        store.create_order(&older).await.unwrap();
        store.create_order(&newer).await.unwrap();

        let orders = store.list_user_orders("a@b.c").await.unwrap();
        assert_eq!(orders[0].trade_no, "NEWER0000000000000A");
        assert_eq!(orders[1].trade_no, "OLDER0000000000000A");
    }

    #[tokio::test]
    async fn user_lookup_roundtrip() {
        let store = MemoryStore::new();
        store.create_user(&user("u9", "z@y.x")).await.unwrap();
        assert!(store.find_user("u9").await.unwrap().is_some());
        assert!(store.find_user_by_email("z@y.x").await.unwrap().is_some());
        assert!(store.find_user_by_email("nobody").await.unwrap().is_none());

        let at = TimestampMs::from_i64(123_456).unwrap();
        store.update_user_login("u9", at).await.unwrap();
        assert_eq!(store.find_user("u9").await.unwrap().unwrap().last_login_at, at);
    }
}
