//! Environment configuration with a startup preflight.
//!
//! Everything arrives via environment variables (a `.env` file is loaded
//! first). The preflight collects every missing or invalid variable into a
//! single error so an operator fixes one deploy, not five.

use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{anyhow, bail};
use payport_common::seal::{IV_LEN, KEY_LEN};

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3000";
const MIN_SESSION_SECRET_LEN: usize = 32;

/// Represents a validated `DEPLOY_ENVIRONMENT` configuration.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DeployEnv {
    /// "dev"
    Dev,
    /// "staging"
    Staging,
    /// "prod"
    Prod,
}

impl DeployEnv {
    /// Shorthand to check whether this [`DeployEnv`] is dev.
    #[inline]
    pub fn is_dev(self) -> bool {
        matches!(self, Self::Dev)
    }
}

impl FromStr for DeployEnv {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "dev" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" => Ok(Self::Prod),
            _ => Err(anyhow!("unknown DEPLOY_ENVIRONMENT '{s}'")),
        }
    }
}

pub struct Config {
    pub deploy_env: DeployEnv,
    pub bind_addr: SocketAddr,

    pub payuni_api_base: String,
    pub payuni_merchant_id: String,
    pub payuni_hash_key: String,
    pub payuni_hash_iv: String,
    pub notify_url: String,

    pub turnstile_secret: String,

    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_url: String,

    pub session_secret: String,

    /// Optional JSON catalog file; the built-in samples otherwise.
    pub products_path: Option<String>,
}

// Keys, secrets, and OAuth credentials stay out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("deploy_env", &self.deploy_env)
            .field("bind_addr", &self.bind_addr)
            .field("payuni_api_base", &self.payuni_api_base)
            .field("payuni_merchant_id", &self.payuni_merchant_id)
            .field("notify_url", &self.notify_url)
            .field("google_client_id", &self.google_client_id)
            .field("google_redirect_url", &self.google_redirect_url)
            .field("products_path", &self.products_path)
            .finish_non_exhaustive()
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::load(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source. Every problem is
    /// reported at once; a config is returned only if all of them pass.
    pub fn load(
        get: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let mut problems = Vec::new();
        let mut require = |name: &str| match get(name) {
            Some(value) if !value.is_empty() => value,
            _ => {
                problems.push(format!("{name} is not set"));
                String::new()
            }
        };

        let payuni_api_base = require("PAYUNI_API_BASE");
        let payuni_merchant_id = require("PAYUNI_MERCHANT_ID");
        let payuni_hash_key = require("PAYUNI_HASH_KEY");
        let payuni_hash_iv = require("PAYUNI_HASH_IV");
        let notify_url = require("NOTIFY_URL");
        let turnstile_secret = require("TURNSTILE_SECRET_KEY");
        let google_client_id = require("GOOGLE_CLIENT_ID");
        let google_client_secret = require("GOOGLE_CLIENT_SECRET");
        let google_redirect_url = require("GOOGLE_REDIRECT_URL");
        let session_secret = require("SESSION_SECRET");

        if !payuni_hash_key.is_empty() && payuni_hash_key.len() != KEY_LEN {
            problems.push(format!(
                "PAYUNI_HASH_KEY must be exactly {KEY_LEN} bytes \
                 (got {})",
                payuni_hash_key.len()
            ));
        }
        if !payuni_hash_iv.is_empty() && payuni_hash_iv.len() != IV_LEN {
            problems.push(format!(
                "PAYUNI_HASH_IV must be exactly {IV_LEN} bytes (got {})",
                payuni_hash_iv.len()
            ));
        }
        if !session_secret.is_empty()
            && session_secret.len() < MIN_SESSION_SECRET_LEN
        {
            problems.push(format!(
                "SESSION_SECRET must be at least {MIN_SESSION_SECRET_LEN} \
                 chars (got {})",
                session_secret.len()
            ));
        }

        let deploy_env = match get("DEPLOY_ENVIRONMENT") {
            None => DeployEnv::Dev,
            Some(value) => match DeployEnv::from_str(&value) {
                Ok(env) => env,
                Err(err) => {
                    problems.push(format!("{err:#}"));
                    DeployEnv::Dev
                }
            },
        };

        let bind_addr = get("BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned());
        let bind_addr = match SocketAddr::from_str(&bind_addr) {
            Ok(addr) => addr,
            Err(_) => {
                problems.push(format!("BIND_ADDR '{bind_addr}' is invalid"));
                SocketAddr::from_str(DEFAULT_BIND_ADDR).expect("default")
            }
        };

        if !problems.is_empty() {
            bail!(
                "configuration preflight failed:\n  - {}",
                problems.join("\n  - ")
            );
        }

        Ok(Self {
            deploy_env,
            bind_addr,
            payuni_api_base,
            payuni_merchant_id,
            payuni_hash_key,
            payuni_hash_iv,
            notify_url,
            turnstile_secret,
            google_client_id,
            google_client_secret,
            google_redirect_url,
            session_secret,
            products_path: get("PRODUCTS_PATH"),
        })
    }

    /// The browser return URL, a sibling of the notify URL.
    pub fn return_url(&self) -> String {
        match self.notify_url.rsplit_once('/') {
            Some((base, _)) => format!("{base}/payment-return"),
            None => "/payment-return".to_owned(),
        }
    }
}
