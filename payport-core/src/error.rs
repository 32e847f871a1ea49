//! The error taxonomy shared by the lifecycle engine and the HTTP surface.
//!
//! Every error is tagged with an [`ErrorKind`] carrying (retryable,
//! http-status). Business operations return `Err`; the payment processor's
//! retry loop is the only place that inspects `retryable`; the HTTP layer
//! renders a sanitized terminal response. The webhook and return-URL
//! handlers never let one of these escape to the framework.

use std::fmt;

use http::StatusCode;
use payport_common::seal::SealError;
use payport_payuni::types::GatewayError;
use thiserror::Error;

/// The closed set of error kinds the system distinguishes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// No authenticated session.
    Unauthorized,
    /// Malformed or unacceptable client input.
    BadRequest,
    /// Human verification (Turnstile) failed.
    TurnstileFailed,
    /// The product cannot be sold the requested way.
    BadProduct,
    /// Order / product / user not found.
    NotFound,
    /// Tampered or mis-keyed envelope.
    InvalidEnvelope,
    /// Signature recomputation mismatch.
    SignatureMismatch,
    /// Webhook amount disagrees with the re-queried amount.
    AmountMismatch,
    /// The order has already completed.
    OrderAlreadyPaid,
    /// Transient store failure.
    DatabaseTransient,
    /// Gateway transport failure.
    RemoteError,
    /// A remote call exceeded its deadline.
    ApiTimeout,
    /// A required subsystem is unavailable (e.g. result cache full).
    ServiceUnavailable,
    /// Everything else.
    Internal,
}

impl ErrorKind {
    /// Whether the coordination layer may retry the failed operation.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            Self::DatabaseTransient
                | Self::RemoteError
                | Self::ApiTimeout
                | Self::ServiceUnavailable
        )
    }

    /// The HTTP status an API endpoint surfaces for this kind.
    pub fn http_status(self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::BadRequest
            | Self::TurnstileFailed
            | Self::BadProduct
            | Self::InvalidEnvelope
            | Self::SignatureMismatch
            | Self::AmountMismatch => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::OrderAlreadyPaid => StatusCode::CONFLICT,
            Self::DatabaseTransient | Self::ServiceUnavailable =>
                StatusCode::SERVICE_UNAVAILABLE,
            Self::RemoteError => StatusCode::BAD_GATEWAY,
            Self::ApiTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The variant name, used as the wire `code` of an error response.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::BadRequest => "BAD_REQUEST",
            Self::TurnstileFailed => "TURNSTILE_FAILED",
            Self::BadProduct => "BAD_PRODUCT",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidEnvelope => "INVALID_ENVELOPE",
            Self::SignatureMismatch => "SIGNATURE_MISMATCH",
            Self::AmountMismatch => "AMOUNT_MISMATCH",
            Self::OrderAlreadyPaid => "ORDER_ALREADY_PAID",
            Self::DatabaseTransient => "DATABASE_TRANSIENT",
            Self::RemoteError => "REMOTE_ERROR",
            Self::ApiTimeout => "API_TIMEOUT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A kind plus human-readable context.
#[derive(Clone, Debug, Error)]
#[error("[{kind}] {msg}")]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, what)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    #[inline]
    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }
}

impl From<SealError> for Error {
    fn from(err: SealError) -> Self {
        Self::new(ErrorKind::InvalidEnvelope, format!("{err:#}"))
    }
}

impl From<GatewayError> for Error {
    fn from(err: GatewayError) -> Self {
        let kind = match &err {
            GatewayError::InvalidEnvelope(_)
            | GatewayError::MissingField(_) => ErrorKind::InvalidEnvelope,
            GatewayError::SignatureMismatch => ErrorKind::SignatureMismatch,
            GatewayError::BadProduct(_) => ErrorKind::BadProduct,
            GatewayError::Remote(_) | GatewayError::Rejected { .. } =>
                ErrorKind::RemoteError,
            GatewayError::Timeout(_) => ErrorKind::ApiTimeout,
            GatewayError::Config(_) => ErrorKind::Internal,
        };
        Self::new(kind, format!("{err:#}"))
    }
}
