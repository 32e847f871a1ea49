//! The payment processor: the only code that moves an order out of PENDING.
//!
//! Runs after the webhook handler has verified, re-queried, and reconciled
//! a notification. Three steps, in order: update the order row, grant the
//! entitlement (bounded retry, then compensation), and record the
//! subscription cycle row.

use std::sync::Arc;
use std::time::Duration;

use payport_common::{backoff, time::TimestampMs};
use payport_payuni::types::{self, ParsedNotify, TradeInfo, TradeStatus};
use tracing::{info, warn};

use crate::catalog::Catalog;
use crate::error::Error;
use crate::models::{
    anchor_trade_no, cycle_sequence, CompensationTask, OrderPatch,
    OrderStatus, PeriodPayment,
};
use crate::store::OrderStore;

/// Grant attempts before the processor gives up and compensates.
const GRANT_ATTEMPTS: u32 = 3;
/// First retry wait; doubles per attempt (1s -> 2s -> 4s).
const GRANT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const GRANT_BACKOFF_MAX: Duration = Duration::from_secs(4);

/// How a verified notification was applied.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProcessOutcome {
    /// Order updated and entitlement granted.
    Granted,
    /// Order updated; grant attempts exhausted, compensation recorded.
    /// The payment itself is real, so the webhook still answers OK.
    Deferred,
    /// Order updated; the trade is not in a paid state, nothing to grant.
    NotPaid,
}

pub struct PaymentProcessor {
    store: Arc<dyn OrderStore>,
    catalog: Arc<Catalog>,
}

impl PaymentProcessor {
    pub fn new(store: Arc<dyn OrderStore>, catalog: Arc<Catalog>) -> Self {
        Self { store, catalog }
    }

    /// Apply a verified `(notification, re-query)` pair.
    ///
    /// Errors returned here are terminal for the webhook (FAIL); the gateway
    /// will redeliver on its own cadence.
    pub async fn process(
        &self,
        parsed: &ParsedNotify,
        query: &TradeInfo,
    ) -> Result<ProcessOutcome, Error> {
        // Subscription cycles all settle onto the _0 anchor order.
        let store_trade_no = if parsed.is_period() {
            anchor_trade_no(&parsed.trade_no)
        } else {
            parsed.trade_no.clone()
        };

        self.update_order(&store_trade_no, parsed, query)
            .await
            .map_err(|err| {
                Error::new(err.kind, format!("order update failed: {}", err.msg))
            })?;

        if !query.is_paid {
            info!(
                trade_no = %store_trade_no,
                status = %query.status_text,
                "trade not paid; order updated, nothing to grant"
            );
            return Ok(ProcessOutcome::NotPaid);
        }

        // The grant dedup key is the cycle's own trade number, so cycle N+1
        // extends while any replay of cycle N is a no-op.
        let outcome = self
            .grant_with_retry(&store_trade_no, &parsed.trade_no, query)
            .await?;

        if parsed.is_period() {
            self.record_period_row(&store_trade_no, parsed, query).await?;
        }

        Ok(outcome)
    }

    /// Step A: settle the re-queried state onto the order row.
    async fn update_order(
        &self,
        store_trade_no: &str,
        parsed: &ParsedNotify,
        query: &TradeInfo,
    ) -> Result<(), Error> {
        let status = TradeStatus::from_code(query.status_code);
        let patch = OrderPatch {
            trade_no: store_trade_no.to_owned(),
            status: Some(OrderStatus::from(status)),
            status_text: Some(query.status_text.clone()),
            gateway_seq: Some(query.trade_seq.clone()),
            period_trade_no: parsed.period_trade_no.clone(),
            payment_method: query.payment_type_text.clone(),
            remark: Some(merge_remark(parsed, query)),
            completed_at: Some(TimestampMs::now()),
        };
        self.store.update_order(&patch).await
    }

    /// Step B: grant the entitlement, retrying transient failures with
    /// exponential backoff. Missing order/product/user is fatal; exhaustion
    /// records a compensation task and succeeds non-fatally.
    async fn grant_with_retry(
        &self,
        store_trade_no: &str,
        grant_source: &str,
        query: &TradeInfo,
    ) -> Result<ProcessOutcome, Error> {
        let mut waits =
            backoff::iter_with(GRANT_BACKOFF_INITIAL, GRANT_BACKOFF_MAX);
        let mut last_err = None;

        for attempt in 1..=GRANT_ATTEMPTS {
            match self.try_grant(store_trade_no, grant_source).await {
                Ok(()) => {
                    info!(
                        trade_no = %store_trade_no,
                        source = %grant_source,
                        "entitlement granted"
                    );
                    return Ok(ProcessOutcome::Granted);
                }
                Err(err) if !err.retryable() => return Err(err),
                Err(err) => {
                    warn!(
                        trade_no = %store_trade_no,
                        attempt,
                        "transient grant failure: {err:#}"
                    );
                    last_err = Some(err);
                    if attempt < GRANT_ATTEMPTS {
                        let wait =
                            waits.next().expect("backoff iter is infinite");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        let reason = last_err
            .map(|err| err.to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        warn!(
            trade_no = %store_trade_no,
            "grant attempts exhausted; recording compensation task: {reason}"
        );
        self.store
            .record_failed_entitlement(&CompensationTask {
                trade_no: store_trade_no.to_owned(),
                amount: query.amount,
                reason,
                attempt: GRANT_ATTEMPTS,
                enqueued_at: TimestampMs::now(),
            })
            .await?;
        Ok(ProcessOutcome::Deferred)
    }

    async fn try_grant(
        &self,
        store_trade_no: &str,
        grant_source: &str,
    ) -> Result<(), Error> {
        let order = self
            .store
            .get_order_by_trade_no(store_trade_no)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!("no order {store_trade_no}"))
            })?;
        let product = self.catalog.get(&order.product_id).ok_or_else(|| {
            Error::not_found(format!("no product {}", order.product_id))
        })?;
        let user = self
            .store
            .find_user_by_email(&order.email)
            .await?
            .ok_or_else(|| {
                Error::not_found(format!("no user for {}", order.email))
            })?;

        self.store
            .grant_entitlement(&user.id, product, grant_source)
            .await
    }

    /// Step C: record the charged cycle, keyed by
    /// (`period_trade_no`, cycle sequence). Duplicates drop silently.
    async fn record_period_row(
        &self,
        store_trade_no: &str,
        parsed: &ParsedNotify,
        query: &TradeInfo,
    ) -> Result<(), Error> {
        let Some(period_trade_no) = parsed.period_trade_no.clone() else {
            // Period amount without a handle; nothing to key the row by.
            warn!(
                trade_no = %parsed.trade_no,
                "period notification without PeriodTradeNo; skipping row"
            );
            return Ok(());
        };

        let row = PeriodPayment {
            period_trade_no,
            base_order_no: store_trade_no.to_owned(),
            sequence_no: cycle_sequence(&parsed.trade_no),
            trade_seq: query.trade_seq.clone(),
            amount: query.amount,
            status: query.status_text.clone(),
            paid_at: query.paid_at.clone().or_else(|| parsed.payment_day.clone()),
            remark: None,
        };
        self.store.record_period_payment(&row).await
    }
}

/// The audit remark: sanitized notify and query fields, merged as JSON.
fn merge_remark(parsed: &ParsedNotify, query: &TradeInfo) -> String {
    let mut notify = parsed.raw.clone();
    let mut queried = query.raw.clone();
    types::strip_sensitive(&mut notify);
    types::strip_sensitive(&mut queried);

    serde_json::json!({
        "notify": notify,
        "query": queried,
    })
    .to_string()
}
