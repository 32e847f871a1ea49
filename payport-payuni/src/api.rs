//! The remote-operations trait the lifecycle engine depends on.
//!
//! The webhook handler re-queries every notification through this trait and
//! the cancel path mutates subscription status through it, so both can be
//! driven against a scripted mock in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::client::{PayuniClient, PeriodAction};
use crate::types::{GatewayError, PeriodInfo, TradeInfo};

#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Authoritative state of a trade, straight from the gateway.
    async fn query_trade(
        &self,
        trade_no: &str,
    ) -> Result<TradeInfo, GatewayError>;

    /// Authoritative state of a subscription.
    async fn query_period(
        &self,
        period_trade_no: &str,
    ) -> Result<PeriodInfo, GatewayError>;

    /// Mutate a subscription's gateway-side status.
    async fn modify_period_status(
        &self,
        action: PeriodAction,
        period_trade_no: &str,
    ) -> Result<BTreeMap<String, String>, GatewayError>;
}

#[async_trait]
impl GatewayApi for PayuniClient {
    async fn query_trade(
        &self,
        trade_no: &str,
    ) -> Result<TradeInfo, GatewayError> {
        PayuniClient::query_trade(self, trade_no).await
    }

    async fn query_period(
        &self,
        period_trade_no: &str,
    ) -> Result<PeriodInfo, GatewayError> {
        PayuniClient::query_period(self, period_trade_no).await
    }

    async fn modify_period_status(
        &self,
        action: PeriodAction,
        period_trade_no: &str,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        PayuniClient::modify_period_status(self, action, period_trade_no).await
    }
}
