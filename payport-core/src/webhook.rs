//! The webhook protocol state machine.
//!
//! Entry point for every gateway-originated POST (server-to-server webhook
//! and, via the HTTP layer, the browser return channel):
//!
//! ```text
//! received -> verify -> parse -> query -> reconcile -> delegate -> respond
//!      \_____ fail -> respond FAIL       \_ mismatch -> respond FAIL
//! ```
//!
//! Webhook contents are notifications only; the truth of record is the
//! synchronous re-query. Every failure path, including timeouts, terminates
//! in a plaintext `FAIL` response. Nothing here ever surfaces an error to
//! the HTTP framework: a 5xx would make the gateway retry in a way the
//! server cannot observe.

use std::sync::Arc;

use payport_common::seal::SealKeys;
use payport_payuni::api::GatewayApi;
use payport_payuni::types::ParsedNotify;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorKind};
use crate::processor::{PaymentProcessor, ProcessOutcome};

/// The three sealed fields plus the plaintext outer status, as POSTed by the
/// gateway on both inbound channels.
#[derive(Clone, Debug, Deserialize)]
pub struct NotifyForm {
    #[serde(rename = "EncryptInfo")]
    pub encrypt_info: String,
    #[serde(rename = "HashInfo")]
    pub hash_info: String,
    /// The unencrypted outer status. Logged, never trusted.
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    #[serde(rename = "MerID", default)]
    pub mer_id: Option<String>,
}

/// The protocol-terminal webhook response body.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WebhookReply {
    Ok,
    Fail,
}

impl WebhookReply {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::Fail => "FAIL",
        }
    }
}

pub struct WebhookHandler {
    keys: SealKeys,
    gateway: Arc<dyn GatewayApi>,
    processor: PaymentProcessor,
}

impl WebhookHandler {
    pub fn new(
        keys: SealKeys,
        gateway: Arc<dyn GatewayApi>,
        processor: PaymentProcessor,
    ) -> Self {
        Self {
            keys,
            gateway,
            processor,
        }
    }

    /// Run the state machine. Infallible by design: every failure is logged
    /// and mapped to [`WebhookReply::Fail`].
    pub async fn handle(&self, form: &NotifyForm) -> WebhookReply {
        match self.run(form).await {
            Ok(outcome) => {
                info!(?outcome, "webhook processed");
                WebhookReply::Ok
            }
            Err(err) => {
                warn!("webhook rejected: {err:#}");
                WebhookReply::Fail
            }
        }
    }

    async fn run(&self, form: &NotifyForm) -> Result<ProcessOutcome, Error> {
        // Verify. Constant-time; the outer status is only logged.
        if !self.keys.verify(&form.encrypt_info, &form.hash_info) {
            return Err(Error::new(
                ErrorKind::SignatureMismatch,
                "webhook hash verification failed",
            ));
        }
        if let Some(outer_status) = &form.status {
            debug!(%outer_status, "webhook outer status");
        }

        // Parse. A payload without MerTradeNo is rejected here.
        let parsed = ParsedNotify::from_envelope(&self.keys, &form.encrypt_info)?;

        // Query, unconditionally. Apparently-successful webhook data never
        // short-circuits the re-query; a failed query aborts with FAIL and
        // the gateway retries.
        let query = self
            .gateway
            .query_trade(&parsed.trade_no)
            .await
            .map_err(Error::from)?;

        // Reconcile amounts as integers before anything is written.
        let claimed = parsed.claimed_amount().ok_or_else(|| {
            Error::bad_request("notification carries no amount")
        })?;
        if claimed != query.amount {
            warn!(
                trade_no = %parsed.trade_no,
                claimed,
                queried = query.amount,
                "amount mismatch; possible tamper"
            );
            return Err(Error::new(
                ErrorKind::AmountMismatch,
                format!("claimed {claimed} but gateway reports {}", query.amount),
            ));
        }

        // Delegate.
        self.processor.process(&parsed, &query).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use payport_common::time::TimestampMs;

    use super::*;
    use crate::catalog::{Catalog, Product};
    use crate::models::{
        CompensationTask, Entitlement, EntitlementStatus, Order, OrderPatch,
        OrderStatus, PeriodPayment, User,
    };
    use crate::order_service::OrderService;
    use crate::store::{memory::MemoryStore, OrderStore};
    use crate::test_utils::{
        notify_form, paid_trade, test_keys, trade_with_status, MockGateway,
    };

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<MockGateway>,
        handler: WebhookHandler,
        orders: OrderService,
        catalog: Arc<Catalog>,
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(MemoryStore::new()))
    }

    fn harness_with_store(store: Arc<MemoryStore>) -> Harness {
        let catalog = Arc::new(Catalog::sample());
        let gateway = Arc::new(MockGateway::new());
        let processor = PaymentProcessor::new(
            store.clone() as Arc<dyn OrderStore>,
            catalog.clone(),
        );
        let handler = WebhookHandler::new(
            test_keys(),
            gateway.clone() as Arc<dyn GatewayApi>,
            processor,
        );
        let orders = OrderService::new(store.clone() as Arc<dyn OrderStore>);
        Harness {
            store,
            gateway,
            handler,
            orders,
            catalog,
        }
    }

    async fn register_user(store: &MemoryStore, id: &str, email: &str) {
        store
            .create_user(&User {
                id: id.to_owned(),
                email: email.to_owned(),
                name: None,
                picture: None,
                created_at: TimestampMs::now(),
                last_login_at: TimestampMs::now(),
            })
            .await
            .unwrap();
    }

    async fn active_entitlements(
        store: &MemoryStore,
        user_id: &str,
    ) -> Vec<Entitlement> {
        store
            .get_user_entitlements(user_id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.status == EntitlementStatus::Active)
            .collect()
    }

    // Scenario: a verified one-shot webhook transitions the order and
    // grants exactly one one-time entitlement.
    #[tokio::test(start_paused = true)]
    async fn verified_one_shot_webhook_grants() {
        let h = harness();
        register_user(&h.store, "u-alice", "alice@example.com").await;
        let product = h.catalog.get("P001").unwrap();
        let (order, _) = h
            .orders
            .find_or_create("alice@example.com", product, "MER123")
            .await
            .unwrap();

        h.gateway
            .script_trade(paid_trade(&order.trade_no, 3500, "S100001"));
        let form = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeNo", "S100001"),
                ("TradeAmt", "3500"),
                ("Status", "SUCCESS"),
            ],
        );

        assert_eq!(h.handler.handle(&form).await, WebhookReply::Ok);

        let updated = h
            .store
            .get_order_by_trade_no(&order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Paid);
        assert_eq!(updated.status_text.as_deref(), Some("已付款"));
        assert_eq!(updated.gateway_seq.as_deref(), Some("S100001"));
        assert!(updated.completed_at.is_some());

        let ents = active_entitlements(&h.store, "u-alice").await;
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].product_id, "P001");
        assert_eq!(ents[0].source_order_id, order.trade_no);
        assert_eq!(ents[0].expiry_date, None);
    }

    // Scenario: the re-queried amount disagrees with the webhook's claim.
    #[tokio::test(start_paused = true)]
    async fn amount_tamper_fails_without_any_write() {
        let h = harness();
        register_user(&h.store, "u-alice", "alice@example.com").await;
        let product = h.catalog.get("P001").unwrap();
        let (order, _) = h
            .orders
            .find_or_create("alice@example.com", product, "MER123")
            .await
            .unwrap();

        // Gateway says 100; the webhook claims 3500.
        h.gateway
            .script_trade(paid_trade(&order.trade_no, 100, "S100001"));
        let form = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeAmt", "3500"),
                ("Status", "SUCCESS"),
            ],
        );

        assert_eq!(h.handler.handle(&form).await, WebhookReply::Fail);

        let untouched = h
            .store
            .get_order_by_trade_no(&order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(untouched.status, OrderStatus::Pending);
        assert!(active_entitlements(&h.store, "u-alice").await.is_empty());
    }

    // Scenario: five replays of the same webhook are all acknowledged, but
    // nothing stacks.
    #[tokio::test(start_paused = true)]
    async fn replayed_webhooks_are_idempotent() {
        let h = harness();
        register_user(&h.store, "u-alice", "alice@example.com").await;
        let product = h.catalog.get("P001").unwrap();
        let (order, _) = h
            .orders
            .find_or_create("alice@example.com", product, "MER123")
            .await
            .unwrap();

        h.gateway
            .script_trade(paid_trade(&order.trade_no, 3500, "S100001"));
        let form = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeAmt", "3500"),
                ("Status", "SUCCESS"),
            ],
        );

        for _ in 0..5 {
            assert_eq!(h.handler.handle(&form).await, WebhookReply::Ok);
        }

        let ents = active_entitlements(&h.store, "u-alice").await;
        assert_eq!(ents.len(), 1);
        assert_eq!(ents[0].expiry_date, None);
    }

    // Scenario: subscription first cycle. The anchor order settles, the
    // entitlement runs one conservative month, and the cycle-0 row lands.
    #[tokio::test(start_paused = true)]
    async fn subscription_first_cycle() {
        let h = harness();
        register_user(&h.store, "u-bob", "bob@example.com").await;
        let product = h.catalog.get("plan_basic").unwrap();
        let (order, _) = h
            .orders
            .find_or_create("bob@example.com", product, "MER123")
            .await
            .unwrap();
        assert!(order.trade_no.ends_with("_0"));

        h.gateway
            .script_trade(paid_trade(&order.trade_no, 299, "S200001"));
        let form = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeNo", "S200001"),
                ("PeriodAmt", "299"),
                ("PeriodTradeNo", "PTN-X"),
                ("Status", "SUCCESS"),
            ],
        );

        let before = TimestampMs::now();
        assert_eq!(h.handler.handle(&form).await, WebhookReply::Ok);

        let updated = h
            .store
            .get_order_by_trade_no(&order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.period_trade_no.as_deref(), Some("PTN-X"));

        let ents = active_entitlements(&h.store, "u-bob").await;
        assert_eq!(ents.len(), 1);
        let expiry = ents[0].expiry_date.unwrap();
        let drift = expiry.as_i64() - before.as_i64() - 32 * DAY_MS;
        assert!(drift.abs() < 60_000, "expiry drifted {drift}ms");

        let rows = h.store.period_payment_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].period_trade_no, "PTN-X");
        assert_eq!(rows[0].sequence_no, 0);
        assert_eq!(rows[0].amount, 299);
    }

    // Scenario: cycle 2 extends from the previous expiry and its row is
    // written exactly once even when the webhook is delivered twice.
    #[tokio::test(start_paused = true)]
    async fn subscription_second_cycle_extends_and_dedups() {
        let h = harness();
        register_user(&h.store, "u-bob", "bob@example.com").await;
        let product = h.catalog.get("plan_basic").unwrap();
        let (order, _) = h
            .orders
            .find_or_create("bob@example.com", product, "MER123")
            .await
            .unwrap();

        // Cycle 0.
        h.gateway
            .script_trade(paid_trade(&order.trade_no, 299, "S200001"));
        let cycle0 = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeNo", "S200001"),
                ("PeriodAmt", "299"),
                ("PeriodTradeNo", "PTN-X"),
                ("Status", "SUCCESS"),
            ],
        );
        assert_eq!(h.handler.handle(&cycle0).await, WebhookReply::Ok);
        let first_expiry = active_entitlements(&h.store, "u-bob").await[0]
            .expiry_date
            .unwrap();

        // Cycle 1 arrives as base_1.
        let base = order.trade_no.trim_end_matches("_0").to_owned();
        let cycle1_no = format!("{base}_1");
        h.gateway.script_trade(paid_trade(&cycle1_no, 299, "S200002"));
        let cycle1 = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", cycle1_no.as_str()),
                ("TradeNo", "S200002"),
                ("PeriodAmt", "299"),
                ("PeriodTradeNo", "PTN-X"),
                ("Status", "SUCCESS"),
            ],
        );
        assert_eq!(h.handler.handle(&cycle1).await, WebhookReply::Ok);
        // Delivered twice.
        assert_eq!(h.handler.handle(&cycle1).await, WebhookReply::Ok);

        let ents = active_entitlements(&h.store, "u-bob").await;
        assert_eq!(ents.len(), 1);
        let second_expiry = ents[0].expiry_date.unwrap();
        // Extended from the previous expiry, not from now.
        assert_eq!(
            second_expiry.as_i64(),
            first_expiry.as_i64() + 32 * DAY_MS
        );

        let rows = h.store.period_payment_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].sequence_no, 1);
        assert_eq!(rows[1].trade_seq, "S200002");
    }

    // Scenario: the user lookup fails transiently on all three attempts.
    // The payment is real, so the webhook still answers OK; repair is
    // recorded for the out-of-band job.
    #[tokio::test(start_paused = true)]
    async fn exhausted_grant_retries_compensate() {
        let memory = Arc::new(MemoryStore::new());
        register_user(&memory, "u-alice", "alice@example.com").await;

        let flaky = Arc::new(FlakyUserLookup {
            inner: memory.clone(),
            failures_left: AtomicU32::new(3),
        });
        let catalog = Arc::new(Catalog::sample());
        let gateway = Arc::new(MockGateway::new());
        let processor = PaymentProcessor::new(
            flaky.clone() as Arc<dyn OrderStore>,
            catalog.clone(),
        );
        let handler = WebhookHandler::new(
            test_keys(),
            gateway.clone() as Arc<dyn GatewayApi>,
            processor,
        );
        let orders = OrderService::new(flaky.clone() as Arc<dyn OrderStore>);

        let product = catalog.get("P001").unwrap();
        let (order, _) = orders
            .find_or_create("alice@example.com", product, "MER123")
            .await
            .unwrap();
        gateway.script_trade(paid_trade(&order.trade_no, 3500, "S100001"));

        let form = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeAmt", "3500"),
                ("Status", "SUCCESS"),
            ],
        );
        assert_eq!(handler.handle(&form).await, WebhookReply::Ok);

        // Order updated, no entitlement, one compensation task.
        let updated = memory
            .get_order_by_trade_no(&order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Paid);
        assert!(active_entitlements(&memory, "u-alice").await.is_empty());

        let tasks = memory.compensation_tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].attempt, 3);
        assert_eq!(tasks[0].trade_no, order.trade_no);
        assert_eq!(tasks[0].amount, 3500);
    }

    #[tokio::test(start_paused = true)]
    async fn tampered_hash_fails_before_the_gateway_is_asked() {
        let h = harness();
        let mut form = notify_form(
            &test_keys(),
            &[("MerTradeNo", "whatever"), ("TradeAmt", "1")],
        );
        form.hash_info = form.hash_info.to_lowercase();

        assert_eq!(h.handler.handle(&form).await, WebhookReply::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_trade_no_fails() {
        let h = harness();
        let form = notify_form(
            &test_keys(),
            &[("TradeAmt", "3500"), ("Status", "SUCCESS")],
        );
        assert_eq!(h.handler.handle(&form).await, WebhookReply::Fail);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_query_fails_the_webhook() {
        let h = harness();
        // Nothing scripted: the mock reports a remote error.
        let form = notify_form(
            &test_keys(),
            &[("MerTradeNo", "UNKNOWN"), ("TradeAmt", "3500")],
        );
        assert_eq!(h.handler.handle(&form).await, WebhookReply::Fail);
    }

    // Scenario: a verified webhook for an unpaid trade updates the order
    // but grants nothing.
    #[tokio::test(start_paused = true)]
    async fn unpaid_trade_updates_order_only() {
        let h = harness();
        register_user(&h.store, "u-alice", "alice@example.com").await;
        let product = h.catalog.get("P001").unwrap();
        let (order, _) = h
            .orders
            .find_or_create("alice@example.com", product, "MER123")
            .await
            .unwrap();

        h.gateway.script_trade(trade_with_status(
            &order.trade_no,
            3500,
            "S100001",
            payport_payuni::types::TradeStatus::PayFailed,
        ));
        let form = notify_form(
            &test_keys(),
            &[
                ("MerTradeNo", order.trade_no.as_str()),
                ("TradeAmt", "3500"),
                ("Status", "FAIL"),
            ],
        );

        assert_eq!(h.handler.handle(&form).await, WebhookReply::Ok);

        let updated = h
            .store
            .get_order_by_trade_no(&order.trade_no)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, OrderStatus::Failed);
        assert!(active_entitlements(&h.store, "u-alice").await.is_empty());
    }

    /// Delegates everything to a [`MemoryStore`] but fails the first N user
    /// lookups with a transient error.
    struct FlakyUserLookup {
        inner: Arc<MemoryStore>,
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl OrderStore for FlakyUserLookup {
        async fn find_pending_order(
            &self,
            email: &str,
            product_id: &str,
        ) -> Result<Option<Order>, Error> {
            self.inner.find_pending_order(email, product_id).await
        }

        async fn create_order(&self, order: &Order) -> Result<(), Error> {
            self.inner.create_order(order).await
        }

        async fn update_order(&self, patch: &OrderPatch) -> Result<(), Error> {
            self.inner.update_order(patch).await
        }

        async fn get_order_by_trade_no(
            &self,
            trade_no: &str,
        ) -> Result<Option<Order>, Error> {
            self.inner.get_order_by_trade_no(trade_no).await
        }

        async fn list_user_orders(
            &self,
            email: &str,
        ) -> Result<Vec<Order>, Error> {
            self.inner.list_user_orders(email).await
        }

        async fn find_user(&self, id: &str) -> Result<Option<User>, Error> {
            self.inner.find_user(id).await
        }

        async fn find_user_by_email(
            &self,
            email: &str,
        ) -> Result<Option<User>, Error> {
            let failures = self.failures_left.load(Ordering::SeqCst);
            if failures > 0 {
                self.failures_left.store(failures - 1, Ordering::SeqCst);
                return Err(Error::new(
                    ErrorKind::DatabaseTransient,
                    "injected user lookup failure",
                ));
            }
            self.inner.find_user_by_email(email).await
        }

        async fn create_user(&self, user: &User) -> Result<(), Error> {
            self.inner.create_user(user).await
        }

        async fn update_user_login(
            &self,
            id: &str,
            at: TimestampMs,
        ) -> Result<(), Error> {
            self.inner.update_user_login(id, at).await
        }

        async fn get_user_entitlements(
            &self,
            user_id: &str,
        ) -> Result<Vec<Entitlement>, Error> {
            self.inner.get_user_entitlements(user_id).await
        }

        async fn grant_entitlement(
            &self,
            user_id: &str,
            product: &Product,
            source_order_id: &str,
        ) -> Result<(), Error> {
            self.inner
                .grant_entitlement(user_id, product, source_order_id)
                .await
        }

        async fn cancel_subscription(
            &self,
            user_id: &str,
            period_trade_no: &str,
        ) -> Result<Entitlement, Error> {
            self.inner.cancel_subscription(user_id, period_trade_no).await
        }

        async fn record_period_payment(
            &self,
            row: &PeriodPayment,
        ) -> Result<(), Error> {
            self.inner.record_period_payment(row).await
        }

        async fn record_failed_entitlement(
            &self,
            task: &CompensationTask,
        ) -> Result<(), Error> {
            self.inner.record_failed_entitlement(task).await
        }
    }
}
