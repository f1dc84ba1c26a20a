use std::collections::HashMap;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::{
    orders::{cancel_pending, find_order, mark_paid},
    ApiJson, SharedCtx,
};
use crate::error::{ApiError, ApiResult};
use crate::mongo::{db, ORDERS};
use crate::order::{doc_to_order, OrderDto};
use crate::payments::{
    paymob::{amount_cents, PaymobTransaction},
    stripe::{parse_event, verify_signature, StripeEvent},
};

#[derive(Serialize)]
pub struct WebhookAck {
    pub ok: bool,
    /// What the callback did to the order: `paid`, `cancelled` or `ignored`.
    pub outcome: &'static str,
    pub order_id: Option<String>,
}

impl WebhookAck {
    fn ignored(order_id: Option<String>) -> Self {
        WebhookAck {
            ok: true,
            outcome: "ignored",
            order_id,
        }
    }
}

/* ================== Paymob ================== */

#[derive(Deserialize)]
pub struct PaymobCallback {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub obj: Value,
}

fn paymob_secret(ctx: &SharedCtx) -> ApiResult<&str> {
    ctx.config
        .paymob
        .as_ref()
        .map(|p| p.hmac_secret.as_str())
        .ok_or_else(|| ApiError::validation("Paymob is not configured"))
}

fn check_hmac(txn: &PaymobTransaction, secret: &str, q: &HashMap<String, String>) -> ApiResult<()> {
    let received = q.get("hmac").map(String::as_str).unwrap_or_default();
    if received.is_empty() || !txn.verify(secret, received) {
        warn!(target: "payments", "paymob callback for txn {} failed HMAC check", txn.transaction_id);
        debug!(target: "payments", "paymob signing string: {}", txn.signing_string());
        return Err(ApiError::Unauthorized("Invalid Paymob HMAC".into()));
    }
    Ok(())
}

/// Our order for a Paymob transaction: by merchant order id first, then by
/// the Paymob order id recorded at checkout.
async fn order_for_txn(txn: &PaymobTransaction) -> ApiResult<Option<OrderDto>> {
    if let Some(id) = &txn.merchant_order_id {
        if let Some(order) = find_order(id).await? {
            return Ok(Some(order));
        }
    }
    if txn.paymob_order_id.is_empty() {
        return Ok(None);
    }
    Ok(db()?
        .collection::<Document>(ORDERS)
        .find_one(doc! { "payment_ref": &txn.paymob_order_id }, None)
        .await?
        .map(|d| doc_to_order(&d)))
}

async fn apply_paymob(txn: &PaymobTransaction) -> ApiResult<WebhookAck> {
    let Some(order) = order_for_txn(txn).await? else {
        warn!(
            target: "payments",
            "paymob txn {} references unknown order {}",
            txn.transaction_id, txn.paymob_order_id
        );
        return Ok(WebhookAck::ignored(None));
    };
    let order_id = Some(order.id.clone());

    if txn.pending || order.payment_settled() {
        return Ok(WebhookAck::ignored(order_id));
    }
    if txn.success {
        if txn.amount_cents != amount_cents(order.total_order_price) {
            warn!(
                target: "payments",
                "paymob txn {} paid {} cents, order {} expects {}",
                txn.transaction_id,
                txn.amount_cents,
                order.id,
                amount_cents(order.total_order_price)
            );
            return Err(ApiError::conflict("Paid amount does not match the order total"));
        }
        let outcome = if mark_paid(&order.id, None).await? { "paid" } else { "ignored" };
        return Ok(WebhookAck { ok: true, outcome, order_id });
    }
    let outcome = if cancel_pending(&order).await? { "cancelled" } else { "ignored" };
    Ok(WebhookAck { ok: true, outcome, order_id })
}

/// Server-to-server "transaction processed" callback.
pub async fn paymob_processed(
    State(ctx): State<SharedCtx>,
    Query(q): Query<HashMap<String, String>>,
    ApiJson(body): ApiJson<PaymobCallback>,
) -> ApiResult<Json<WebhookAck>> {
    let txn = PaymobTransaction::from_json(&body.obj);
    check_hmac(&txn, paymob_secret(&ctx)?, &q)?;

    if let Some(kind) = body.kind.as_deref().filter(|k| *k != "TRANSACTION") {
        info!(target: "payments", "paymob callback of type {kind} ignored");
        return Ok(Json(WebhookAck::ignored(None)));
    }
    info!(
        target: "payments",
        "paymob txn {} success={} pending={}",
        txn.transaction_id, txn.success, txn.pending
    );
    Ok(Json(apply_paymob(&txn).await?))
}

/// Browser redirect after the hosted payment page; same fields as a query string.
pub async fn paymob_redirect(
    State(ctx): State<SharedCtx>,
    Query(q): Query<HashMap<String, String>>,
) -> ApiResult<Json<WebhookAck>> {
    let txn = PaymobTransaction::from_query(&q);
    check_hmac(&txn, paymob_secret(&ctx)?, &q)?;
    Ok(Json(apply_paymob(&txn).await?))
}

/* ================== Stripe ================== */

pub async fn stripe_event(
    State(ctx): State<SharedCtx>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookAck>> {
    let cfg = ctx
        .config
        .stripe
        .as_ref()
        .ok_or_else(|| ApiError::validation("Stripe is not configured"))?;
    let header = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::validation("Missing Stripe-Signature header"))?;
    verify_signature(
        &body,
        header,
        &cfg.webhook_secret,
        OffsetDateTime::now_utc().unix_timestamp(),
    )?;

    match parse_event(&body)? {
        StripeEvent::CheckoutCompleted {
            order_id,
            session_id,
        } => {
            let Some(order) = find_order(&order_id).await? else {
                warn!(target: "payments", "stripe session {session_id} for unknown order {order_id}");
                return Ok(Json(WebhookAck::ignored(None)));
            };
            let paid = !order.payment_settled() && mark_paid(&order.id, Some(session_id.as_str())).await?;
            Ok(Json(WebhookAck {
                ok: true,
                outcome: if paid { "paid" } else { "ignored" },
                order_id: Some(order.id),
            }))
        }
        StripeEvent::CheckoutExpired { order_id } => {
            let Some(order) = find_order(&order_id).await? else {
                return Ok(Json(WebhookAck::ignored(None)));
            };
            let cancelled = cancel_pending(&order).await?;
            Ok(Json(WebhookAck {
                ok: true,
                outcome: if cancelled { "cancelled" } else { "ignored" },
                order_id: Some(order.id),
            }))
        }
        StripeEvent::Ignored(kind) => {
            info!(target: "payments", "stripe event {kind} ignored");
            Ok(Json(WebhookAck::ignored(None)))
        }
    }
}
