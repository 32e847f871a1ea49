//! Everything a request handler needs, wired once at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use payport_common::seal::SealKeys;
use payport_core::catalog::Catalog;
use payport_core::order_service::OrderService;
use payport_core::processor::PaymentProcessor;
use payport_core::store::{memory::MemoryStore, OrderStore};
use payport_core::token_cache::ResultTokenCache;
use payport_core::webhook::WebhookHandler;
use payport_payuni::{GatewayApi, PayuniClient, PayuniConfig};
use tracing::info;

use crate::auth::{HumanVerifier, SessionSigner, Turnstile};
use crate::config::Config;
use crate::rate_limit::RateLimiter;

/// Request-wide limit: 200 requests per 15 minutes per IP.
const GENERAL_LIMIT: (u32, Duration) = (200, Duration::from_secs(15 * 60));
/// Checkout endpoints: 5 per minute per IP.
const CHECKOUT_LIMIT: (u32, Duration) = (5, Duration::from_secs(60));
/// Result token reads: 10 per minute per IP.
const TOKEN_READ_LIMIT: (u32, Duration) = (10, Duration::from_secs(60));

pub struct AppContext {
    pub config: Config,
    pub catalog: Arc<Catalog>,
    pub store: Arc<dyn OrderStore>,
    pub orders: OrderService,
    pub payuni: PayuniClient,
    pub gateway: Arc<dyn GatewayApi>,
    pub webhook: WebhookHandler,
    pub tokens: ResultTokenCache,
    pub sessions: SessionSigner,
    pub turnstile: Arc<dyn HumanVerifier>,
    pub general_limit: RateLimiter,
    pub checkout_limit: RateLimiter,
    pub token_read_limit: RateLimiter,
}

impl AppContext {
    pub fn new(config: Config) -> anyhow::Result<Arc<Self>> {
        let keys =
            SealKeys::new(&config.payuni_hash_key, &config.payuni_hash_iv)
                .context("bad PAYUNI_HASH_KEY / PAYUNI_HASH_IV")?;

        let catalog = match &config.products_path {
            Some(path) => {
                let json = std::fs::read_to_string(path)
                    .with_context(|| format!("could not read {path}"))?;
                Catalog::from_json_str(&json)
                    .with_context(|| format!("could not parse {path}"))?
            }
            None => Catalog::sample(),
        };
        info!(products = catalog.len(), "catalog loaded");

        // The in-memory reference store. A durable adapter (spreadsheet,
        // RDBMS) plugs in behind the same port.
        let store: Arc<dyn OrderStore> = Arc::new(MemoryStore::new());

        let payuni = PayuniClient::new(
            PayuniConfig {
                merchant_id: config.payuni_merchant_id.clone(),
                api_base: config.payuni_api_base.clone(),
                notify_url: config.notify_url.clone(),
            },
            keys.clone(),
        )
        .context("could not build gateway client")?;
        let gateway: Arc<dyn GatewayApi> = Arc::new(payuni.clone());

        let catalog = Arc::new(catalog);
        let processor = PaymentProcessor::new(store.clone(), catalog.clone());
        let webhook = WebhookHandler::new(keys, gateway.clone(), processor);

        let sessions = SessionSigner::new(&config.session_secret);
        let turnstile: Arc<dyn HumanVerifier> =
            Arc::new(Turnstile::new(config.turnstile_secret.clone())?);

        Ok(Arc::new(Self {
            orders: OrderService::new(store.clone()),
            catalog,
            store,
            payuni,
            gateway,
            webhook,
            tokens: ResultTokenCache::new(),
            sessions,
            turnstile,
            general_limit: RateLimiter::new(GENERAL_LIMIT.0, GENERAL_LIMIT.1),
            checkout_limit: RateLimiter::new(
                CHECKOUT_LIMIT.0,
                CHECKOUT_LIMIT.1,
            ),
            token_read_limit: RateLimiter::new(
                TOKEN_READ_LIMIT.0,
                TOKEN_READ_LIMIT.1,
            ),
            config,
        }))
    }
}
