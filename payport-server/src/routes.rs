//! The axum router and request handlers.
//!
//! Handlers are thin: authenticate, rate-limit, validate, then call into
//! the lifecycle engine. API endpoints answer JSON; `/payuni-webhook`
//! answers plaintext `OK`/`FAIL`; `/payment-return` always answers a 302.
//! The two gateway-facing endpoints are exempt from CSRF and sessions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Form, Path, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{header, StatusCode};
use payport_core::models::{EntitlementStatus, ProductType};
use payport_core::store::OrderStore;
use payport_core::token_cache::ResultSnapshot;
use payport_core::webhook::NotifyForm;
use payport_core::{Error, ErrorKind};
use payport_payuni::client::PeriodAction;
use payport_payuni::GatewayApi;
use serde::Deserialize;
use serde_json::json;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::auth;
use crate::context::AppContext;

const BODY_LIMIT: usize = 16 * 1024;
const API_TIMEOUT: Duration = Duration::from_secs(15);

pub fn router(ctx: Arc<AppContext>) -> Router {
    let api = Router::new()
        .route("/order-result/{token}", get(order_result))
        .route("/my-orders", get(my_orders))
        .route("/subscriptions", get(subscriptions))
        .route(
            "/subscriptions/{period_trade_no}/cancel",
            post(cancel_subscription),
        )
        .layer(TimeoutLayer::new(API_TIMEOUT));

    Router::new()
        .route("/create-payment", post(create_payment))
        .route("/create-subscription", post(create_subscription))
        .route("/payment-return", post(payment_return))
        .route("/payuni-webhook", post(payuni_webhook))
        .nest("/api", api)
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            general_rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .with_state(ctx)
}

// --- Middleware --- //

async fn general_rate_limit(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !ctx.general_limit.check(addr.ip()) {
        return rate_limited();
    }
    next.run(request).await
}

// --- Checkout --- //

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutBody {
    product_id: String,
    turnstile_token: String,
}

async fn create_payment(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: http::HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Response {
    checkout(&ctx, addr, &headers, &body, false).await
}

async fn create_subscription(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: http::HeaderMap,
    Json(body): Json<CheckoutBody>,
) -> Response {
    checkout(&ctx, addr, &headers, &body, true).await
}

async fn checkout(
    ctx: &AppContext,
    addr: SocketAddr,
    headers: &http::HeaderMap,
    body: &CheckoutBody,
    subscription: bool,
) -> Response {
    if !ctx.checkout_limit.check(addr.ip()) {
        return rate_limited();
    }
    if !auth::check_csrf(headers) {
        return csrf_failure();
    }
    let user = match ctx.sessions.authenticate(headers) {
        Ok(user) => user,
        Err(err) => return error_response(ctx, err),
    };
    if let Err(err) = ctx
        .turnstile
        .verify(&body.turnstile_token, Some(&addr.ip().to_string()))
        .await
    {
        return error_response(ctx, err);
    }

    let Some(product) = ctx.catalog.get(&body.product_id) else {
        return error_response(
            ctx,
            Error::not_found(format!("no product {}", body.product_id)),
        );
    };

    let expected_kind = if subscription {
        ProductType::Subscription
    } else {
        ProductType::OneTime
    };
    if product.kind != expected_kind {
        return error_response(
            ctx,
            Error::new(
                ErrorKind::BadProduct,
                format!("product {} is not {expected_kind}", product.id),
            ),
        );
    }

    // A one-time product the user already holds has nothing left to sell.
    if !subscription {
        match ctx.store.get_user_entitlements(&user.id).await {
            Ok(entitlements) =>
                if entitlements.iter().any(|e| {
                    e.product_id == product.id
                        && e.status == EntitlementStatus::Active
                }) {
                    return error_response(
                        ctx,
                        Error::new(
                            ErrorKind::OrderAlreadyPaid,
                            format!("{} already owns {}", user.email, product.id),
                        ),
                    );
                },
            Err(err) => return error_response(ctx, err),
        }
    }

    let (order, _reused) = match ctx
        .orders
        .find_or_create(&user.email, product, ctx.payuni.merchant_id())
        .await
    {
        Ok(result) => result,
        Err(err) => return error_response(ctx, err),
    };

    let return_url = ctx.config.return_url();
    let built = if subscription {
        product.subscription_plan().and_then(|plan| {
            ctx.payuni
                .build_subscription(
                    &order.trade_no,
                    &plan,
                    &user.email,
                    &return_url,
                )
                .map_err(Error::from)
        })
    } else {
        ctx.payuni
            .build_one_shot(
                &order.trade_no,
                product.price,
                &product.name,
                &user.email,
                &return_url,
            )
            .map_err(Error::from)
    };

    match built {
        Ok(checkout) => Json(checkout).into_response(),
        Err(err) => error_response(ctx, err),
    }
}

// --- Gateway-facing endpoints --- //

/// Browser-delivered POST after the user-visible flow. Verifies and parses
/// only; the order store is never touched from this path. The truth of
/// record arrives via the webhook.
async fn payment_return(
    State(ctx): State<Arc<AppContext>>,
    form: Result<Form<NotifyForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return redirect_to("/result.html?status=fail&reason=processing_error");
    };

    if !ctx.payuni.verify_inbound(&form.encrypt_info, &form.hash_info) {
        warn!("payment return failed hash verification");
        return redirect_to("/result.html?status=fail&reason=invalid_hash");
    }

    let parsed = match ctx.payuni.parse_inbound(&form.encrypt_info) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!("payment return unparsable: {err:#}");
            return redirect_to(
                "/result.html?status=fail&reason=processing_error",
            );
        }
    };

    let status = if parsed.status == "SUCCESS" { "success" } else { "fail" };
    let snapshot = ResultSnapshot {
        status: status.to_owned(),
        trade_no: parsed.trade_no.clone(),
        trade_seq: parsed.trade_seq.clone(),
        amount: parsed.claimed_amount(),
        paid_at: parsed.payment_day.clone(),
        message: None,
    };

    match ctx.tokens.put(snapshot) {
        Ok(token) => redirect_to(&format!("/result.html?token={token}")),
        Err(err) => {
            warn!("result snapshot not cached: {err:#}");
            redirect_to("/result.html?status=fail&reason=processing_error")
        }
    }
}

/// Server-to-server callback. Always answers 200 with plaintext `OK` or
/// `FAIL`; anything else would make the gateway retry blindly.
async fn payuni_webhook(
    State(ctx): State<Arc<AppContext>>,
    form: Result<Form<NotifyForm>, FormRejection>,
) -> Response {
    let reply = match form {
        Ok(Form(form)) => ctx.webhook.handle(&form).await,
        Err(rejection) => {
            warn!("webhook body rejected: {rejection}");
            payport_core::webhook::WebhookReply::Fail
        }
    };
    (StatusCode::OK, reply.as_str()).into_response()
}

// --- Authenticated API --- //

async fn order_result(
    State(ctx): State<Arc<AppContext>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(token): Path<String>,
) -> Response {
    if !ctx.token_read_limit.check(addr.ip()) {
        return rate_limited();
    }
    match ctx.tokens.take(&token) {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(
            &ctx,
            Error::not_found("unknown or already-consumed token"),
        ),
    }
}

async fn my_orders(
    State(ctx): State<Arc<AppContext>>,
    headers: http::HeaderMap,
) -> Response {
    let user = match ctx.sessions.authenticate(&headers) {
        Ok(user) => user,
        Err(err) => return error_response(&ctx, err),
    };
    match ctx.store.list_user_orders(&user.email).await {
        Ok(orders) => Json(orders).into_response(),
        Err(err) => error_response(&ctx, err),
    }
}

async fn subscriptions(
    State(ctx): State<Arc<AppContext>>,
    headers: http::HeaderMap,
) -> Response {
    let user = match ctx.sessions.authenticate(&headers) {
        Ok(user) => user,
        Err(err) => return error_response(&ctx, err),
    };
    match ctx.store.get_user_entitlements(&user.id).await {
        Ok(entitlements) => {
            let subscriptions = entitlements
                .into_iter()
                .filter(|e| e.kind == ProductType::Subscription)
                .collect::<Vec<_>>();
            Json(subscriptions).into_response()
        }
        Err(err) => error_response(&ctx, err),
    }
}

/// Ends the subscription at the gateway first, then cancels the
/// entitlement. If either gateway call fails, the entitlement is untouched.
async fn cancel_subscription(
    State(ctx): State<Arc<AppContext>>,
    headers: http::HeaderMap,
    Path(period_trade_no): Path<String>,
) -> Response {
    if !auth::check_csrf(&headers) {
        return csrf_failure();
    }
    let user = match ctx.sessions.authenticate(&headers) {
        Ok(user) => user,
        Err(err) => return error_response(&ctx, err),
    };

    // Confirm the handle against the gateway before mutating anything.
    let period = match ctx.gateway.query_period(&period_trade_no).await {
        Ok(period) => period,
        Err(err) => return error_response(&ctx, Error::from(err)),
    };
    tracing::debug!(
        period_trade_no = %period.period_trade_no,
        status = %period.status,
        "cancelling subscription"
    );

    if let Err(err) = ctx
        .gateway
        .modify_period_status(PeriodAction::End, &period_trade_no)
        .await
    {
        return error_response(&ctx, Error::from(err));
    }

    match ctx.store.cancel_subscription(&user.id, &period_trade_no).await {
        Ok(entitlement) => Json(entitlement).into_response(),
        Err(err) => error_response(&ctx, err),
    }
}

// --- Response helpers --- //

/// Render an error as the structured JSON body. Messages are generalized in
/// staging/prod and verbose in dev.
fn error_response(ctx: &AppContext, err: Error) -> Response {
    let status = err.kind.http_status();
    if status.is_server_error() {
        error!("{err:#}");
    } else {
        warn!("{err:#}");
    }

    let message = if ctx.config.deploy_env.is_dev() {
        err.msg.clone()
    } else {
        generic_message(err.kind).to_owned()
    };
    let body = json!({ "code": err.kind.name(), "message": message });
    (status, Json(body)).into_response()
}

fn generic_message(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Unauthorized => "Authentication required",
        ErrorKind::BadRequest
        | ErrorKind::InvalidEnvelope
        | ErrorKind::SignatureMismatch
        | ErrorKind::AmountMismatch => "Invalid request",
        ErrorKind::TurnstileFailed => "Human verification failed",
        ErrorKind::BadProduct => "Product cannot be purchased this way",
        ErrorKind::NotFound => "Not found",
        ErrorKind::OrderAlreadyPaid => "Order already completed",
        ErrorKind::DatabaseTransient
        | ErrorKind::RemoteError
        | ErrorKind::ApiTimeout
        | ErrorKind::ServiceUnavailable => "Service temporarily unavailable",
        ErrorKind::Internal => "Internal error",
    }
}

fn csrf_failure() -> Response {
    let body = json!({
        "code": "CSRF_VALIDATION_FAILED",
        "message": "CSRF validation failed",
    });
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

fn rate_limited() -> Response {
    let body = json!({
        "code": "RATE_LIMITED",
        "message": "Too many requests; slow down",
    });
    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

/// A literal 302 (the gateway contract), not axum's 303/307 helpers.
fn redirect_to(location: &str) -> Response {
    (
        StatusCode::FOUND,
        [(header::LOCATION, location.to_owned())],
    )
        .into_response()
}
