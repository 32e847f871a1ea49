//! Session authentication and the human-verification port.
//!
//! Login itself (Google OAuth) happens outside the payment core; what the
//! core needs is an authenticated identity. That interface is an
//! HMAC-signed session cookie minted at login time and checked here, plus a
//! Turnstile verifier for the checkout endpoints.

use std::time::Duration;

use async_trait::async_trait;
use http::HeaderMap;
use payport_common::{hex, time::TimestampMs};
use payport_core::{Error, ErrorKind};
use ring::hmac;
use serde::Deserialize;

pub const SESSION_COOKIE: &str = "payport_session";
pub const CSRF_COOKIE: &str = "payport_csrf";
pub const CSRF_HEADER: &str = "x-csrf-token";

const SITEVERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";
const TURNSTILE_TIMEOUT: Duration = Duration::from_secs(10);

/// The authenticated identity a session resolves to.
#[derive(Clone, Debug)]
pub struct AuthUser {
    /// The identity provider's subject.
    pub id: String,
    pub email: String,
}

/// Mints and checks session tokens: `hex(payload) . hex(hmac)` over
/// `id|email|expiry_ms`, keyed by the session secret.
pub struct SessionSigner {
    key: hmac::Key,
}

impl SessionSigner {
    pub fn new(session_secret: &str) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, session_secret.as_bytes()),
        }
    }

    /// Mint a session token for a logged-in user.
    pub fn issue(&self, user: &AuthUser, ttl: Duration) -> String {
        let expires_at = TimestampMs::now().saturating_add(ttl);
        let payload =
            format!("{}|{}|{}", user.id, user.email, expires_at.as_i64());
        let tag = hmac::sign(&self.key, payload.as_bytes());
        format!(
            "{}.{}",
            hex::encode(payload.as_bytes()),
            hex::encode(tag.as_ref())
        )
    }

    /// Check a session token's signature and expiry.
    pub fn check(&self, token: &str) -> Option<AuthUser> {
        let (payload_hex, tag_hex) = token.split_once('.')?;
        let payload = hex::decode(payload_hex).ok()?;
        let tag = hex::decode(tag_hex).ok()?;
        // Constant-time verification.
        hmac::verify(&self.key, &payload, &tag).ok()?;

        let payload = String::from_utf8(payload).ok()?;
        let mut parts = payload.splitn(3, '|');
        let id = parts.next()?.to_owned();
        let email = parts.next()?.to_owned();
        let expires_at = parts.next()?.parse::<i64>().ok()?;

        if expires_at <= TimestampMs::now().as_i64() {
            return None;
        }
        Some(AuthUser { id, email })
    }

    /// Resolve the authenticated user from request headers, or 401.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<AuthUser, Error> {
        cookie_value(headers, SESSION_COOKIE)
            .and_then(|token| self.check(&token))
            .ok_or_else(|| {
                Error::new(ErrorKind::Unauthorized, "no valid session")
            })
    }
}

/// Double-submit CSRF check: the `x-csrf-token` header must match the CSRF
/// cookie. The gateway-facing endpoints are exempt by not calling this.
pub fn check_csrf(headers: &HeaderMap) -> bool {
    let cookie = cookie_value(headers, CSRF_COOKIE);
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    match (cookie, header) {
        (Some(cookie), Some(header)) if !cookie.is_empty() =>
            payport_common::seal::equals_ct(
                cookie.as_bytes(),
                header.as_bytes(),
            ),
        _ => false,
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(http::header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_owned())
    })
}

// --- Turnstile --- //

/// The human-verification port for the checkout endpoints.
#[async_trait]
pub trait HumanVerifier: Send + Sync {
    async fn verify(
        &self,
        token: &str,
        remote_ip: Option<&str>,
    ) -> Result<(), Error>;
}

/// Cloudflare Turnstile `siteverify`.
pub struct Turnstile {
    secret: String,
    http: reqwest::Client,
}

#[derive(Deserialize)]
struct SiteverifyResponse {
    success: bool,
    #[serde(rename = "error-codes", default)]
    error_codes: Vec<String>,
}

impl Turnstile {
    pub fn new(secret: String) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(TURNSTILE_TIMEOUT)
            .build()
            .map_err(|err| Error::internal(format!("{err:#}")))?;
        Ok(Self { secret, http })
    }
}

#[async_trait]
impl HumanVerifier for Turnstile {
    async fn verify(
        &self,
        token: &str,
        remote_ip: Option<&str>,
    ) -> Result<(), Error> {
        let mut form = vec![
            ("secret", self.secret.as_str()),
            ("response", token),
        ];
        if let Some(ip) = remote_ip {
            form.push(("remoteip", ip));
        }

        let response = self
            .http
            .post(SITEVERIFY_URL)
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                Error::new(ErrorKind::RemoteError, format!("{err:#}"))
            })?
            .json::<SiteverifyResponse>()
            .await
            .map_err(|err| {
                Error::new(ErrorKind::RemoteError, format!("{err:#}"))
            })?;

        if !response.success {
            return Err(Error::new(
                ErrorKind::TurnstileFailed,
                format!(
                    "turnstile rejected: {}",
                    response.error_codes.join(", ")
                ),
            ));
        }
        Ok(())
    }
}
