//! The product catalog.
//!
//! Process-wide and immutable after startup: constructed once from a JSON
//! file (or the built-in samples) and injected into handlers.

use std::collections::HashMap;
use std::time::Duration;

use payport_payuni::client::SubscriptionPlan;
use payport_payuni::types::{FirstCharge, PeriodType};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind};
use crate::models::ProductType;

/// Conservative period lengths for entitlement extension. The gateway
/// charges on calendar boundaries; extending by slightly more than the
/// calendar period guarantees access never lapses between a charge and its
/// webhook.
const WEEK_LENGTH: Duration = Duration::from_secs(8 * 24 * 60 * 60);
const MONTH_LENGTH: Duration = Duration::from_secs(32 * 24 * 60 * 60);
const YEAR_LENGTH: Duration = Duration::from_secs(366 * 24 * 60 * 60);

/// Subscription billing parameters of a product.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodConfig {
    pub period_type: PeriodType,
    /// Day-of-period the gateway charges on.
    pub period_date: String,
    /// Total number of cycles to authorize.
    pub period_times: u32,
    pub first_charge: FirstCharge,
    #[serde(default)]
    pub first_amount: Option<u64>,
}

/// One sellable product.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Minor currency units.
    pub price: u64,
    pub kind: ProductType,
    #[serde(default)]
    pub period: Option<PeriodConfig>,
}

impl Product {
    /// The gateway subscription plan for this product, or `BadProduct` if it
    /// isn't configured for subscriptions.
    pub fn subscription_plan(&self) -> Result<SubscriptionPlan, Error> {
        if self.kind != ProductType::Subscription {
            return Err(Error::new(
                ErrorKind::BadProduct,
                format!("product {} is not a subscription", self.id),
            ));
        }
        let period = self.period.as_ref().ok_or_else(|| {
            Error::new(
                ErrorKind::BadProduct,
                format!("product {} lacks period configuration", self.id),
            )
        })?;

        Ok(SubscriptionPlan {
            amount: self.price,
            description: self.name.clone(),
            period_type: period.period_type,
            period_date: period.period_date.clone(),
            period_times: period.period_times,
            first_charge: period.first_charge,
            first_amount: period.first_amount,
        })
    }

    /// How far one verified cycle extends an entitlement.
    /// `None` for one-time products.
    pub fn period_length(&self) -> Option<Duration> {
        let period = self.period.as_ref()?;
        Some(match period.period_type {
            PeriodType::Week => WEEK_LENGTH,
            PeriodType::Month => MONTH_LENGTH,
            PeriodType::Year => YEAR_LENGTH,
        })
    }
}

/// The process-wide product catalog.
#[derive(Clone, Debug)]
pub struct Catalog {
    products: HashMap<String, Product>,
}

impl Catalog {
    pub fn new(products: Vec<Product>) -> Self {
        let products = products
            .into_iter()
            .map(|product| (product.id.clone(), product))
            .collect();
        Self { products }
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let products = serde_json::from_str::<Vec<Product>>(json)?;
        Ok(Self::new(products))
    }

    pub fn get(&self, product_id: &str) -> Option<&Product> {
        self.products.get(product_id)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }

    /// The built-in sample catalog, used when no catalog file is configured.
    pub fn sample() -> Self {
        Self::new(vec![
            Product {
                id: "P001".to_owned(),
                name: "Course P001".to_owned(),
                price: 3500,
                kind: ProductType::OneTime,
                period: None,
            },
            Product {
                id: "plan_basic".to_owned(),
                name: "Basic plan".to_owned(),
                price: 299,
                kind: ProductType::Subscription,
                period: Some(PeriodConfig {
                    period_type: PeriodType::Month,
                    period_date: "01".to_owned(),
                    period_times: 12,
                    first_charge: FirstCharge::Build,
                    first_amount: None,
                }),
            },
        ])
    }
}
