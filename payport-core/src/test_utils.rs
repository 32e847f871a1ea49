//! Test fixtures shared across crate boundaries: a scripted gateway mock
//! and builders for wire-realistic webhook forms.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use payport_common::seal::SealKeys;
use payport_payuni::api::GatewayApi;
use payport_payuni::client::PeriodAction;
use payport_payuni::types::{
    GatewayError, PaymentType, PeriodInfo, TradeInfo, TradeStatus,
};

use crate::webhook::NotifyForm;

/// The keys every fixture seals with.
pub fn test_keys() -> SealKeys {
    SealKeys::new("01234567890123456789012345678901", "0123456789012345")
        .unwrap()
}

/// A scripted [`GatewayApi`]: returns exactly the trade records it was told
/// to, and errors on anything unscripted.
#[derive(Default)]
pub struct MockGateway {
    trades: Mutex<HashMap<String, TradeInfo>>,
    periods: Mutex<HashMap<String, PeriodInfo>>,
    period_actions: Mutex<Vec<(PeriodAction, String)>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_trade(&self, info: TradeInfo) {
        self.trades
            .lock()
            .unwrap()
            .insert(info.trade_no.clone(), info);
    }

    pub fn script_period(&self, info: PeriodInfo) {
        self.periods
            .lock()
            .unwrap()
            .insert(info.period_trade_no.clone(), info);
    }

    /// Every `modify_period_status` call observed, in order.
    pub fn period_actions(&self) -> Vec<(PeriodAction, String)> {
        self.period_actions.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayApi for MockGateway {
    async fn query_trade(
        &self,
        trade_no: &str,
    ) -> Result<TradeInfo, GatewayError> {
        self.trades
            .lock()
            .unwrap()
            .get(trade_no)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Remote(format!("unscripted trade {trade_no}"))
            })
    }

    async fn query_period(
        &self,
        period_trade_no: &str,
    ) -> Result<PeriodInfo, GatewayError> {
        self.periods
            .lock()
            .unwrap()
            .get(period_trade_no)
            .cloned()
            .ok_or_else(|| {
                GatewayError::Remote(format!(
                    "unscripted period {period_trade_no}"
                ))
            })
    }

    async fn modify_period_status(
        &self,
        action: PeriodAction,
        period_trade_no: &str,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        self.period_actions
            .lock()
            .unwrap()
            .push((action, period_trade_no.to_owned()));
        Ok(BTreeMap::from([(
            "Status".to_owned(),
            "SUCCESS".to_owned(),
        )]))
    }
}

/// A paid trade record, as a re-query would report it.
pub fn paid_trade(trade_no: &str, amount: u64, trade_seq: &str) -> TradeInfo {
    trade_with_status(trade_no, amount, trade_seq, TradeStatus::Paid)
}

pub fn trade_with_status(
    trade_no: &str,
    amount: u64,
    trade_seq: &str,
    status: TradeStatus,
) -> TradeInfo {
    TradeInfo {
        trade_no: trade_no.to_owned(),
        trade_seq: trade_seq.to_owned(),
        status_code: status.code(),
        status_text: status.text().to_owned(),
        amount,
        payment_type: Some(PaymentType::CreditCard),
        payment_type_text: Some(PaymentType::CreditCard.text().to_owned()),
        paid_at: Some("2024-07-01 10:00:00".to_owned()),
        is_paid: status.is_paid(),
        raw: BTreeMap::new(),
    }
}

/// Seal `fields` into a wire-realistic webhook form.
pub fn notify_form(keys: &SealKeys, fields: &[(&str, &str)]) -> NotifyForm {
    let plaintext = serde_urlencoded_pairs(fields);
    let encrypt_info = keys.seal(&plaintext).unwrap();
    let hash_info = keys.hash(&encrypt_info);
    NotifyForm {
        encrypt_info,
        hash_info,
        status: Some("SUCCESS".to_owned()),
        mer_id: Some("MER123".to_owned()),
    }
}

fn serde_urlencoded_pairs(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}
