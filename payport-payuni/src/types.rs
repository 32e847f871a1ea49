//! Typed views of the gateway wire format.
//!
//! The gateway's own payloads are loosely-typed form fields; everything is
//! parsed into the typed records here before it crosses into the lifecycle
//! engine. Downstream code must not index raw gateway field maps.

use std::collections::BTreeMap;
use std::fmt;

use payport_common::seal::{SealError, SealKeys};
use thiserror::Error;

/// Gateway adapter errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Tampered or mis-keyed envelope. Non-retryable.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(#[from] SealError),

    /// The response `HashInfo` did not match our recomputation. Fatal.
    #[error("gateway signature mismatch")]
    SignatureMismatch,

    /// The gateway answered with an outer `Status` other than `SUCCESS`.
    #[error("gateway rejected request: {status}: {message}")]
    Rejected { status: String, message: String },

    /// Transport-level failure (connect, non-2xx, bad JSON).
    /// Retryable at the caller's discretion.
    #[error("gateway remote error: {0}")]
    Remote(String),

    /// The remote call exceeded its deadline. Retryable.
    #[error("gateway call timed out: {0}")]
    Timeout(String),

    /// A required field was absent from a decrypted payload.
    #[error("gateway payload missing field: {0}")]
    MissingField(&'static str),

    /// The product's period configuration cannot be expressed on the wire.
    #[error("bad product: {0}")]
    BadProduct(&'static str),

    /// Local configuration problem (e.g. the HTTP client failed to build).
    #[error("gateway adapter config error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Whether the caller may reasonably retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Remote(_) | Self::Timeout(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(format!("{err:#}"))
        } else {
            Self::Remote(format!("{err:#}"))
        }
    }
}

// --- Status and payment type maps --- //

/// The gateway's trade status codes with their canonical display text.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TradeStatus {
    /// 0 取號成功
    NumberIssued,
    /// 1 已付款
    Paid,
    /// 2 付款失敗
    PayFailed,
    /// 3 付款取消
    PayCancelled,
    /// 4 交易逾期
    Expired,
    /// 8 訂單待確認
    AwaitingConfirm,
    /// 9 未付款
    Unpaid,
    /// Any code this version of the software doesn't recognize.
    Unknown(u8),
}

impl TradeStatus {
    pub fn from_code(code: u8) -> Self {
        match code {
            0 => Self::NumberIssued,
            1 => Self::Paid,
            2 => Self::PayFailed,
            3 => Self::PayCancelled,
            4 => Self::Expired,
            8 => Self::AwaitingConfirm,
            9 => Self::Unpaid,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::NumberIssued => 0,
            Self::Paid => 1,
            Self::PayFailed => 2,
            Self::PayCancelled => 3,
            Self::Expired => 4,
            Self::AwaitingConfirm => 8,
            Self::Unpaid => 9,
            Self::Unknown(code) => code,
        }
    }

    /// The gateway's canonical display text for this status.
    pub fn text(self) -> &'static str {
        match self {
            Self::NumberIssued => "取號成功",
            Self::Paid => "已付款",
            Self::PayFailed => "付款失敗",
            Self::PayCancelled => "付款取消",
            Self::Expired => "交易逾期",
            Self::AwaitingConfirm => "訂單待確認",
            Self::Unpaid => "未付款",
            Self::Unknown(_) => "未知狀態",
        }
    }

    #[inline]
    pub fn is_paid(self) -> bool {
        matches!(self, Self::Paid)
    }
}

impl fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// The gateway's payment method codes with their canonical display text.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PaymentType {
    /// 1 信用卡
    CreditCard,
    /// 2 ATM
    Atm,
    /// 3 超商代碼
    CvsCode,
    /// 5 貨到付款
    Cod,
    /// 6 ICash
    ICash,
    /// 7 Aftee
    Aftee,
    /// 9 LinePay
    LinePay,
    /// 10 宅配到付
    HomeDeliveryCod,
    /// 11 街口
    JkoPay,
    /// Any code this version of the software doesn't recognize.
    Unknown(u8),
}

impl PaymentType {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::CreditCard,
            2 => Self::Atm,
            3 => Self::CvsCode,
            5 => Self::Cod,
            6 => Self::ICash,
            7 => Self::Aftee,
            9 => Self::LinePay,
            10 => Self::HomeDeliveryCod,
            11 => Self::JkoPay,
            other => Self::Unknown(other),
        }
    }

    pub fn text(self) -> &'static str {
        match self {
            Self::CreditCard => "信用卡",
            Self::Atm => "ATM",
            Self::CvsCode => "超商代碼",
            Self::Cod => "貨到付款",
            Self::ICash => "ICash",
            Self::Aftee => "Aftee",
            Self::LinePay => "LinePay",
            Self::HomeDeliveryCod => "宅配到付",
            Self::JkoPay => "街口",
            Self::Unknown(_) => "其他",
        }
    }
}

impl fmt::Display for PaymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text())
    }
}

/// Billing period granularity for subscriptions.
/// Serializes as its wire encoding so catalog files read like the gateway
/// contract.
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum PeriodType {
    #[serde(rename = "W")]
    Week,
    #[serde(rename = "M")]
    Month,
    #[serde(rename = "Y")]
    Year,
}

impl PeriodType {
    /// The single-letter wire encoding (`PeriodType` request field).
    pub fn wire(self) -> &'static str {
        match self {
            Self::Week => "W",
            Self::Month => "M",
            Self::Year => "Y",
        }
    }

    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "W" => Some(Self::Week),
            "M" => Some(Self::Month),
            "Y" => Some(Self::Year),
            _ => None,
        }
    }
}

/// When the first subscription cycle is charged (`FType` request field).
#[derive(Copy, Clone, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum FirstCharge {
    /// Authorize immediately when the subscription is built.
    #[serde(rename = "build")]
    Build,
    /// Authorize on the first `PeriodDate`.
    #[serde(rename = "date")]
    Date,
}

impl FirstCharge {
    pub fn wire(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Date => "date",
        }
    }
}

// --- Typed query records --- //

/// The typed result of a synchronous trade query. This is the only shape in
/// which gateway query data crosses into the payment processor.
#[derive(Clone, Debug)]
pub struct TradeInfo {
    /// Our `MerTradeNo`.
    pub trade_no: String,
    /// The gateway-assigned sequence (`TradeNo` on the wire).
    pub trade_seq: String,
    pub status_code: u8,
    /// Canonical display text for `status_code`.
    pub status_text: String,
    /// Amount in minor currency units.
    pub amount: u64,
    pub payment_type: Option<PaymentType>,
    pub payment_type_text: Option<String>,
    pub paid_at: Option<String>,
    pub is_paid: bool,
    /// The un-flattened raw response fields, for audit.
    pub raw: BTreeMap<String, String>,
}

impl TradeInfo {
    /// Build a [`TradeInfo`] from un-flattened query response fields.
    pub fn from_raw(
        raw: BTreeMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let trade_no = raw
            .get("MerTradeNo")
            .cloned()
            .ok_or(GatewayError::MissingField("MerTradeNo"))?;
        let trade_seq = raw
            .get("TradeNo")
            .cloned()
            .ok_or(GatewayError::MissingField("TradeNo"))?;
        let status_code = raw
            .get("TradeStatus")
            .and_then(|s| s.parse::<u8>().ok())
            .ok_or(GatewayError::MissingField("TradeStatus"))?;
        let amount = raw
            .get("TradeAmt")
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or(GatewayError::MissingField("TradeAmt"))?;

        let status = TradeStatus::from_code(status_code);
        let payment_type = raw
            .get("PaymentType")
            .and_then(|s| s.parse::<u8>().ok())
            .map(PaymentType::from_code);

        Ok(Self {
            trade_no,
            trade_seq,
            status_code,
            status_text: status.text().to_owned(),
            amount,
            payment_type,
            payment_type_text: payment_type.map(|p| p.text().to_owned()),
            paid_at: raw.get("PayTime").cloned(),
            is_paid: status.is_paid(),
            raw,
        })
    }
}

/// The typed result of a synchronous period (subscription) query.
#[derive(Clone, Debug)]
pub struct PeriodInfo {
    pub period_trade_no: String,
    /// Gateway-side period status, verbatim.
    pub status: String,
    pub period_type: Option<PeriodType>,
    /// Total authorized cycles.
    pub total_times: Option<u32>,
    /// Cycles already charged.
    pub charged_times: Option<u32>,
    pub raw: BTreeMap<String, String>,
}

impl PeriodInfo {
    pub fn from_raw(
        raw: BTreeMap<String, String>,
    ) -> Result<Self, GatewayError> {
        let period_trade_no = raw
            .get("PeriodTradeNo")
            .cloned()
            .ok_or(GatewayError::MissingField("PeriodTradeNo"))?;
        let status = raw
            .get("TradeStatus")
            .cloned()
            .ok_or(GatewayError::MissingField("TradeStatus"))?;

        Ok(Self {
            period_trade_no,
            status,
            period_type: raw
                .get("PeriodType")
                .and_then(|s| PeriodType::from_wire(s)),
            total_times: raw
                .get("PeriodTimes")
                .and_then(|s| s.parse().ok()),
            charged_times: raw
                .get("AlreadyTimes")
                .and_then(|s| s.parse().ok()),
            raw,
        })
    }
}

// --- Inbound notifications --- //

/// A decrypted, typed notification from either inbound channel (webhook or
/// browser return POST).
#[derive(Clone, Debug)]
pub struct ParsedNotify {
    /// Our `MerTradeNo`. Always present; a payload without one is rejected.
    pub trade_no: String,
    /// The gateway sequence, if the gateway included it.
    pub trade_seq: Option<String>,
    /// The decrypted inner `Status` field, verbatim (e.g. `SUCCESS`).
    pub status: String,
    pub trade_amt: Option<u64>,
    pub period_amt: Option<u64>,
    pub period_trade_no: Option<String>,
    pub payment_type: Option<PaymentType>,
    pub payment_day: Option<String>,
    pub raw: BTreeMap<String, String>,
}

impl ParsedNotify {
    /// Open an inbound envelope and lift it into a typed notification.
    ///
    /// Does NOT verify the `HashInfo` signature; callers check that first
    /// via [`SealKeys::verify`].
    pub fn from_envelope(
        keys: &SealKeys,
        envelope: &str,
    ) -> Result<Self, GatewayError> {
        let plaintext = keys.open(envelope)?;
        let raw = decode_form(&plaintext)?;

        let trade_no = raw
            .get("MerTradeNo")
            .filter(|s| !s.is_empty())
            .cloned()
            .ok_or(GatewayError::MissingField("MerTradeNo"))?;

        Ok(Self {
            trade_no,
            trade_seq: raw.get("TradeNo").cloned(),
            status: raw.get("Status").cloned().unwrap_or_default(),
            trade_amt: raw.get("TradeAmt").and_then(|s| s.parse().ok()),
            period_amt: raw.get("PeriodAmt").and_then(|s| s.parse().ok()),
            period_trade_no: raw
                .get("PeriodTradeNo")
                .filter(|s| !s.is_empty())
                .cloned(),
            payment_type: raw
                .get("PaymentType")
                .and_then(|s| s.parse::<u8>().ok())
                .map(PaymentType::from_code),
            payment_day: raw.get("PaymentDay").cloned(),
            raw,
        })
    }

    /// Whether this notification belongs to a subscription cycle.
    pub fn is_period(&self) -> bool {
        self.period_amt.is_some_and(|amt| amt > 0)
            || self.period_trade_no.is_some()
    }

    /// The amount this notification claims was charged: `PeriodAmt` for
    /// subscription cycles, `TradeAmt` otherwise. Reconciled against the
    /// re-queried amount before any order transition.
    pub fn claimed_amount(&self) -> Option<u64> {
        if self.is_period() {
            self.period_amt.or(self.trade_amt)
        } else {
            self.trade_amt
        }
    }
}

/// Decode an application/x-www-form-urlencoded plaintext into a field map.
pub fn decode_form(
    plaintext: &str,
) -> Result<BTreeMap<String, String>, GatewayError> {
    serde_urlencoded::from_str::<Vec<(String, String)>>(plaintext)
        .map(|pairs| pairs.into_iter().collect())
        .map_err(|_| GatewayError::InvalidEnvelope(SealError::Encoding))
}

/// Remove card-holder data from a raw field map before it is logged or
/// persisted in an order remark.
pub fn strip_sensitive(raw: &mut BTreeMap<String, String>) {
    raw.retain(|key, _| !key.contains("Card"));
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trade_status_map_is_canonical() {
        for (code, text) in [
            (0u8, "取號成功"),
            (1, "已付款"),
            (2, "付款失敗"),
            (3, "付款取消"),
            (4, "交易逾期"),
            (8, "訂單待確認"),
            (9, "未付款"),
        ] {
            let status = TradeStatus::from_code(code);
            assert_eq!(status.code(), code);
            assert_eq!(status.text(), text);
            assert_eq!(status.is_paid(), code == 1);
        }
        assert_eq!(TradeStatus::from_code(7), TradeStatus::Unknown(7));
    }

    #[test]
    fn payment_type_map_is_canonical() {
        for (code, text) in [
            (1u8, "信用卡"),
            (2, "ATM"),
            (3, "超商代碼"),
            (5, "貨到付款"),
            (6, "ICash"),
            (7, "Aftee"),
            (9, "LinePay"),
            (10, "宅配到付"),
            (11, "街口"),
        ] {
            assert_eq!(PaymentType::from_code(code).text(), text);
        }
        assert_eq!(PaymentType::from_code(4), PaymentType::Unknown(4));
    }

    #[test]
    fn parsed_notify_requires_trade_no() {
        let keys = test_keys();
        let envelope = keys.seal("Status=SUCCESS&TradeAmt=100").unwrap();
        let err = ParsedNotify::from_envelope(&keys, &envelope).unwrap_err();
        assert!(matches!(err, GatewayError::MissingField("MerTradeNo")));
    }

    #[test]
    fn parsed_notify_period_detection() {
        let keys = test_keys();

        let one_shot = keys
            .seal("MerTradeNo=abc&Status=SUCCESS&TradeAmt=3500")
            .unwrap();
        let parsed = ParsedNotify::from_envelope(&keys, &one_shot).unwrap();
        assert!(!parsed.is_period());
        assert_eq!(parsed.claimed_amount(), Some(3500));

        let cycle = keys
            .seal(
                "MerTradeNo=abc_1&Status=SUCCESS&PeriodAmt=299\
                 &PeriodTradeNo=PTN-X",
            )
            .unwrap();
        let parsed = ParsedNotify::from_envelope(&keys, &cycle).unwrap();
        assert!(parsed.is_period());
        assert_eq!(parsed.claimed_amount(), Some(299));
        assert_eq!(parsed.period_trade_no.as_deref(), Some("PTN-X"));
    }

    #[test]
    fn url_encoded_values_decode() {
        let keys = test_keys();
        let envelope = keys
            .seal("MerTradeNo=abc&UsrMail=alice%40example.com")
            .unwrap();
        let parsed = ParsedNotify::from_envelope(&keys, &envelope).unwrap();
        assert_eq!(
            parsed.raw.get("UsrMail").map(String::as_str),
            Some("alice@example.com")
        );
    }

    #[test]
    fn strip_sensitive_drops_card_fields() {
        let mut raw = BTreeMap::from([
            ("CardNo".to_owned(), "4111111111111111".to_owned()),
            ("CardCVC".to_owned(), "123".to_owned()),
            ("TradeAmt".to_owned(), "3500".to_owned()),
        ]);
        strip_sensitive(&mut raw);
        assert_eq!(raw.len(), 1);
        assert!(raw.contains_key("TradeAmt"));
    }

    fn test_keys() -> SealKeys {
        SealKeys::new("01234567890123456789012345678901", "0123456789012345")
            .unwrap()
    }
}
