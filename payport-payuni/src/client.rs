//! The PAYUNi HTTP client: checkout envelope builders for the
//! browser-initiated flows plus the synchronous JSON query/modify APIs.

use std::collections::BTreeMap;
use std::time::Duration;

use payport_common::seal::SealKeys;
use payport_common::time::TimestampMs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{
    decode_form, FirstCharge, GatewayError, ParsedNotify, PeriodInfo,
    PeriodType, TradeInfo,
};

/// Per-call timeout for every remote gateway operation.
const REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

/// The universal payment page (one-shot checkout POST target).
const UPP_PATH: &str = "/api/upp";
/// The subscription checkout POST target.
const PERIOD_PATH: &str = "/api/period";
/// Synchronous trade query.
const TRADE_QUERY_PATH: &str = "/api/trade/query";
/// Synchronous period status mutation / query.
const PERIOD_STATUS_PATH: &str = "/api/period/status";
const PERIOD_QUERY_PATH: &str = "/api/period/query";

const VERSION: &str = "1.0";

/// Gateway connection parameters, from configuration.
#[derive(Clone, Debug)]
pub struct PayuniConfig {
    pub merchant_id: String,
    /// e.g. `https://sandbox-api.payuni.com.tw`
    pub api_base: String,
    /// Where the gateway should POST server-to-server notifications.
    pub notify_url: String,
}

/// The three sealed fields every gateway message carries, in the shape we
/// hand back to the web client for its checkout form POST.
#[derive(Clone, Debug, Serialize)]
pub struct CheckoutForm {
    #[serde(rename = "MerID")]
    pub mer_id: String,
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "EncryptInfo")]
    pub encrypt_info: String,
    #[serde(rename = "HashInfo")]
    pub hash_info: String,
}

/// A ready-to-POST checkout: the gateway URL and the sealed form.
#[derive(Clone, Debug, Serialize)]
pub struct CheckoutRequest {
    #[serde(rename = "postUrl")]
    pub post_url: String,
    pub form: CheckoutForm,
}

/// Subscription parameters, as resolved from the product catalog.
#[derive(Clone, Debug)]
pub struct SubscriptionPlan {
    /// Per-cycle amount in minor currency units.
    pub amount: u64,
    pub description: String,
    pub period_type: PeriodType,
    /// Day-of-period the gateway charges on (wire `PeriodDate`).
    pub period_date: String,
    /// Total number of cycles to authorize.
    pub period_times: u32,
    pub first_charge: FirstCharge,
    /// Optional distinct first-cycle amount (wire `FAmt`).
    pub first_amount: Option<u64>,
}

/// Requests for the JSON APIs (query / period status).
#[derive(Serialize)]
struct WireRequest<'a> {
    #[serde(rename = "MerID")]
    mer_id: &'a str,
    #[serde(rename = "Version")]
    version: &'a str,
    #[serde(rename = "EncryptInfo")]
    encrypt_info: String,
    #[serde(rename = "HashInfo")]
    hash_info: String,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "EncryptInfo", default)]
    encrypt_info: Option<String>,
    #[serde(rename = "HashInfo", default)]
    hash_info: Option<String>,
}

/// Stateless facade over the remote gateway. Cheap to clone.
#[derive(Clone)]
pub struct PayuniClient {
    config: PayuniConfig,
    keys: SealKeys,
    http: reqwest::Client,
}

impl PayuniClient {
    pub fn new(
        config: PayuniConfig,
        keys: SealKeys,
    ) -> Result<Self, GatewayError> {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .map_err(|err| GatewayError::Config(format!("{err:#}")))?;
        Ok(Self { config, keys, http })
    }

    pub fn merchant_id(&self) -> &str {
        &self.config.merchant_id
    }

    // --- Checkout builders --- //

    /// Build a one-shot checkout envelope for the universal payment page.
    pub fn build_one_shot(
        &self,
        trade_no: &str,
        amount: u64,
        description: &str,
        email: &str,
        return_url: &str,
    ) -> Result<CheckoutRequest, GatewayError> {
        let fields = vec![
            ("MerID", self.config.merchant_id.clone()),
            ("MerTradeNo", trade_no.to_owned()),
            ("TradeAmt", amount.to_string()),
            ("ProdDesc", description.to_owned()),
            ("UsrMail", email.to_owned()),
            ("Timestamp", unix_seconds().to_string()),
            ("NotifyURL", self.config.notify_url.clone()),
            ("ReturnURL", return_url.to_owned()),
        ];
        self.checkout(UPP_PATH, fields)
    }

    /// Build a first-cycle subscription authorization envelope.
    pub fn build_subscription(
        &self,
        trade_no: &str,
        plan: &SubscriptionPlan,
        email: &str,
        return_url: &str,
    ) -> Result<CheckoutRequest, GatewayError> {
        if plan.period_times == 0 {
            return Err(GatewayError::BadProduct("PeriodTimes must be >= 1"));
        }
        if plan.period_date.is_empty() {
            return Err(GatewayError::BadProduct("PeriodDate must be set"));
        }

        let mut fields = vec![
            ("MerID", self.config.merchant_id.clone()),
            ("MerTradeNo", trade_no.to_owned()),
            ("PeriodAmt", plan.amount.to_string()),
            ("ProdDesc", plan.description.clone()),
            ("PayerEmail", email.to_owned()),
            // Payer info is fixed by the merchant, not editable on the page.
            ("PayerFix", "3".to_owned()),
            ("PeriodType", plan.period_type.wire().to_owned()),
            ("PeriodDate", plan.period_date.clone()),
            ("PeriodTimes", plan.period_times.to_string()),
            ("FType", plan.first_charge.wire().to_owned()),
        ];
        if let Some(first_amount) = plan.first_amount {
            fields.push(("FAmt", first_amount.to_string()));
        }
        fields.push(("NotifyURL", self.config.notify_url.clone()));
        fields.push(("ReturnURL", return_url.to_owned()));

        self.checkout(PERIOD_PATH, fields)
    }

    fn checkout(
        &self,
        path: &str,
        fields: Vec<(&str, String)>,
    ) -> Result<CheckoutRequest, GatewayError> {
        let (encrypt_info, hash_info) = self.seal_fields(&fields)?;
        Ok(CheckoutRequest {
            post_url: format!("{}{path}", self.config.api_base),
            form: CheckoutForm {
                mer_id: self.config.merchant_id.clone(),
                version: VERSION.to_owned(),
                encrypt_info,
                hash_info,
            },
        })
    }

    // --- Inbound verification --- //

    /// Verify an inbound `(envelope, hash)` pair in constant time.
    pub fn verify_inbound(&self, envelope: &str, hash: &str) -> bool {
        self.keys.verify(envelope, hash)
    }

    /// Open and type an inbound envelope. Verify first.
    pub fn parse_inbound(
        &self,
        envelope: &str,
    ) -> Result<ParsedNotify, GatewayError> {
        ParsedNotify::from_envelope(&self.keys, envelope)
    }

    // --- Synchronous JSON APIs --- //

    /// Query the authoritative state of a trade. This is the trust-but-verify
    /// backstop: webhook contents are never believed without it.
    pub async fn query_trade(
        &self,
        trade_no: &str,
    ) -> Result<TradeInfo, GatewayError> {
        let fields = vec![
            ("MerID", self.config.merchant_id.clone()),
            ("MerTradeNo", trade_no.to_owned()),
            ("Timestamp", unix_seconds().to_string()),
        ];
        let raw = self.call(TRADE_QUERY_PATH, fields).await?;
        TradeInfo::from_raw(raw)
    }

    /// Query the state of a subscription by its gateway handle.
    pub async fn query_period(
        &self,
        period_trade_no: &str,
    ) -> Result<PeriodInfo, GatewayError> {
        let fields = vec![
            ("MerID", self.config.merchant_id.clone()),
            ("PeriodTradeNo", period_trade_no.to_owned()),
            ("Timestamp", unix_seconds().to_string()),
        ];
        let raw = self.call(PERIOD_QUERY_PATH, fields).await?;
        PeriodInfo::from_raw(raw)
    }

    /// Mutate a subscription's gateway-side status.
    pub async fn modify_period_status(
        &self,
        action: PeriodAction,
        period_trade_no: &str,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        let fields = vec![
            ("MerID", self.config.merchant_id.clone()),
            ("PeriodTradeNo", period_trade_no.to_owned()),
            ("TradeStatus", action.wire().to_owned()),
            ("Timestamp", unix_seconds().to_string()),
        ];
        self.call(PERIOD_STATUS_PATH, fields).await
    }

    /// Seal, POST, verify, open: one round trip on a JSON API.
    async fn call(
        &self,
        path: &str,
        fields: Vec<(&str, String)>,
    ) -> Result<BTreeMap<String, String>, GatewayError> {
        let (encrypt_info, hash_info) = self.seal_fields(&fields)?;
        let url = format!("{}{path}", self.config.api_base);
        debug!(%url, "gateway request");

        let request = WireRequest {
            mer_id: &self.config.merchant_id,
            version: VERSION,
            encrypt_info,
            hash_info,
        };
        let response = self
            .http
            .post(&url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<WireResponse>()
            .await?;

        // The outer Status is logged but not trusted; the envelope hash is
        // what authenticates the response.
        debug!(status = %response.status, "gateway response");
        if response.status != "SUCCESS" {
            return Err(GatewayError::Rejected {
                status: response.status,
                message: response.message.unwrap_or_default(),
            });
        }

        let encrypt_info = response
            .encrypt_info
            .ok_or(GatewayError::MissingField("EncryptInfo"))?;
        let hash_info = response
            .hash_info
            .ok_or(GatewayError::MissingField("HashInfo"))?;
        if !self.keys.verify(&encrypt_info, &hash_info) {
            warn!(%url, "gateway response failed signature verification");
            return Err(GatewayError::SignatureMismatch);
        }

        let plaintext = self.keys.open(&encrypt_info)?;
        Ok(un_flatten(decode_form(&plaintext)?))
    }

    /// Render an ordered field list as form-urlencoded plaintext, then seal
    /// it and compute its hash. The plaintext never reaches a log.
    fn seal_fields(
        &self,
        fields: &[(&str, String)],
    ) -> Result<(String, String), GatewayError> {
        let plaintext = serde_urlencoded::to_string(fields)
            .map_err(|err| GatewayError::Config(format!("{err:#}")))?;
        let envelope = self.keys.seal(&plaintext)?;
        let hash = self.keys.hash(&envelope);
        Ok((envelope, hash))
    }
}

/// Gateway-side subscription status mutations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PeriodAction {
    Suspend,
    Restart,
    End,
    Reauthorize,
}

impl PeriodAction {
    fn wire(self) -> &'static str {
        match self {
            Self::Suspend => "0",
            Self::Restart => "1",
            Self::End => "2",
            Self::Reauthorize => "3",
        }
    }
}

fn unix_seconds() -> i64 {
    TimestampMs::now().as_i64() / 1000
}

/// Query responses arrive with flattened `Result[0][Field]` keys; lift them
/// back into plain field names.
fn un_flatten(raw: BTreeMap<String, String>) -> BTreeMap<String, String> {
    raw.into_iter()
        .map(|(key, value)| {
            let unflattened = key
                .strip_prefix("Result[0][")
                .and_then(|rest| rest.strip_suffix(']'))
                .map(str::to_owned)
                .unwrap_or(key);
            (unflattened, value)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use payport_common::seal::SealKeys;

    use super::*;

    fn test_client() -> PayuniClient {
        let config = PayuniConfig {
            merchant_id: "MER123".to_owned(),
            api_base: "https://sandbox-api.payuni.test".to_owned(),
            notify_url: "https://shop.test/payuni-webhook".to_owned(),
        };
        PayuniClient::new(config, test_keys()).unwrap()
    }

    fn test_keys() -> SealKeys {
        SealKeys::new("01234567890123456789012345678901", "0123456789012345")
            .unwrap()
    }

    #[test]
    fn one_shot_checkout_is_openable_and_complete() {
        let client = test_client();
        let checkout = client
            .build_one_shot(
                "AbCdEfGhIjKlMnOpQrSt",
                3500,
                "Course P001",
                "alice@example.com",
                "https://shop.test/payment-return",
            )
            .unwrap();

        assert_eq!(
            checkout.post_url,
            "https://sandbox-api.payuni.test/api/upp"
        );
        assert_eq!(checkout.form.mer_id, "MER123");
        assert_eq!(checkout.form.version, "1.0");
        assert!(client
            .verify_inbound(&checkout.form.encrypt_info, &checkout.form.hash_info));

        let plaintext = test_keys().open(&checkout.form.encrypt_info).unwrap();
        let fields = decode_form(&plaintext).unwrap();
        assert_eq!(fields.get("MerTradeNo").unwrap().len(), 20);
        assert_eq!(fields.get("TradeAmt").map(String::as_str), Some("3500"));
        assert_eq!(
            fields.get("UsrMail").map(String::as_str),
            Some("alice@example.com")
        );
        assert_eq!(
            fields.get("NotifyURL").map(String::as_str),
            Some("https://shop.test/payuni-webhook")
        );
    }

    #[test]
    fn subscription_checkout_carries_period_fields() {
        let client = test_client();
        let plan = SubscriptionPlan {
            amount: 299,
            description: "Basic plan".to_owned(),
            period_type: PeriodType::Month,
            period_date: "01".to_owned(),
            period_times: 12,
            first_charge: FirstCharge::Build,
            first_amount: None,
        };
        let checkout = client
            .build_subscription(
                "AbCdEfGhIjKlMnOpQrSt_0",
                &plan,
                "bob@example.com",
                "https://shop.test/payment-return",
            )
            .unwrap();

        assert_eq!(
            checkout.post_url,
            "https://sandbox-api.payuni.test/api/period"
        );

        let plaintext = test_keys().open(&checkout.form.encrypt_info).unwrap();
        let fields = decode_form(&plaintext).unwrap();
        assert_eq!(fields.get("PeriodAmt").map(String::as_str), Some("299"));
        assert_eq!(fields.get("PeriodType").map(String::as_str), Some("M"));
        assert_eq!(fields.get("PeriodTimes").map(String::as_str), Some("12"));
        assert_eq!(fields.get("FType").map(String::as_str), Some("build"));
        assert_eq!(fields.get("PayerFix").map(String::as_str), Some("3"));
        assert_eq!(
            fields.get("PayerEmail").map(String::as_str),
            Some("bob@example.com")
        );
        assert!(!fields.contains_key("FAmt"));
    }

    #[test]
    fn subscription_checkout_rejects_bad_plans() {
        let client = test_client();
        let mut plan = SubscriptionPlan {
            amount: 299,
            description: "Basic plan".to_owned(),
            period_type: PeriodType::Month,
            period_date: "01".to_owned(),
            period_times: 0,
            first_charge: FirstCharge::Build,
            first_amount: None,
        };
        assert!(matches!(
            client.build_subscription("t_0", &plan, "a@b.c", "r"),
            Err(GatewayError::BadProduct(_))
        ));

        plan.period_times = 12;
        plan.period_date = String::new();
        assert!(matches!(
            client.build_subscription("t_0", &plan, "a@b.c", "r"),
            Err(GatewayError::BadProduct(_))
        ));
    }

    #[test]
    fn un_flatten_lifts_result_keys() {
        let raw = BTreeMap::from([
            ("Result[0][TradeNo]".to_owned(), "S100001".to_owned()),
            ("Result[0][TradeStatus]".to_owned(), "1".to_owned()),
            ("Status".to_owned(), "SUCCESS".to_owned()),
        ]);
        let flat = un_flatten(raw);
        assert_eq!(flat.get("TradeNo").map(String::as_str), Some("S100001"));
        assert_eq!(flat.get("TradeStatus").map(String::as_str), Some("1"));
        assert_eq!(flat.get("Status").map(String::as_str), Some("SUCCESS"));
    }

    #[test]
    fn trade_info_from_unflattened_raw() {
        let raw = BTreeMap::from([
            ("MerTradeNo".to_owned(), "AbCdEfGhIjKlMnOpQrSt".to_owned()),
            ("TradeNo".to_owned(), "S100001".to_owned()),
            ("TradeStatus".to_owned(), "1".to_owned()),
            ("TradeAmt".to_owned(), "3500".to_owned()),
            ("PaymentType".to_owned(), "1".to_owned()),
            ("PayTime".to_owned(), "2024-07-01 10:00:00".to_owned()),
        ]);
        let info = TradeInfo::from_raw(raw).unwrap();
        assert!(info.is_paid);
        assert_eq!(info.status_text, "已付款");
        assert_eq!(info.amount, 3500);
        assert_eq!(info.trade_seq, "S100001");
        assert_eq!(info.payment_type_text.as_deref(), Some("信用卡"));
    }
}
