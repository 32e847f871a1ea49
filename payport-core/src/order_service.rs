//! Order de-duplication and creation.

use std::sync::Arc;

use payport_common::rng::{Crng, RngExt, SysRng};
use payport_common::time::TimestampMs;
use tracing::info;

use crate::catalog::Product;
use crate::error::Error;
use crate::models::{Order, OrderStatus, ProductType};
use crate::store::OrderStore;

/// Opaque trade numbers are 20 alphanumeric characters from a CSPRNG.
const TRADE_NO_LEN: usize = 20;

/// Generate a fresh opaque trade number matching `[A-Za-z0-9]{20}`.
pub fn generate_trade_no<R: Crng>(rng: &mut R) -> String {
    rng.gen_alphanum(TRADE_NO_LEN)
}

pub struct OrderService {
    store: Arc<dyn OrderStore>,
}

impl OrderService {
    pub fn new(store: Arc<dyn OrderStore>) -> Self {
        Self { store }
    }

    /// Reuse the buyer's existing PENDING order for this product, or create
    /// a fresh one. Returns the order and whether it was reused (the caller
    /// reseals a checkout envelope around the same trade number either way).
    pub async fn find_or_create(
        &self,
        email: &str,
        product: &Product,
        merchant_id: &str,
    ) -> Result<(Order, bool), Error> {
        if let Some(existing) =
            self.store.find_pending_order(email, &product.id).await?
        {
            info!(
                trade_no = %existing.trade_no,
                product_id = %product.id,
                "reusing pending order"
            );
            return Ok((existing, true));
        }

        let base = generate_trade_no(&mut SysRng::new());
        let trade_no = match product.kind {
            ProductType::OneTime => base,
            // Subscriptions anchor at cycle 0.
            ProductType::Subscription => format!("{base}_0"),
        };

        let order = Order {
            trade_no,
            merchant_id: merchant_id.to_owned(),
            amount: product.price,
            status: OrderStatus::Pending,
            status_text: None,
            email: email.to_owned(),
            created_at: TimestampMs::now(),
            completed_at: None,
            gateway_seq: None,
            product_id: product.id.clone(),
            product_name: product.name.clone(),
            product_type: product.kind,
            period_trade_no: None,
            payment_method: None,
            remark: None,
        };

        self.store.create_order(&order).await.map_err(|err| {
            Error::new(err.kind, format!("order create failed: {}", err.msg))
        })?;

        info!(
            trade_no = %order.trade_no,
            product_id = %product.id,
            amount = order.amount,
            "created order"
        );
        Ok((order, false))
    }
}
