use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Document};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{cart::find_cart, ApiJson, AuthUser, SharedCtx};
use crate::checkout::{self, transition_error};
use crate::error::{ApiError, ApiResult};
use crate::mongo::{db, sort_created_at_desc, ORDERS};
use crate::order::{doc_to_order, OrderDto, OrderStatus, PaymentMethod, ShippingAddress};
use crate::payments::{
    paymob::{BillingData, PaymobClient},
    stripe::StripeClient,
};
use crate::store::{MongoStore, Store};
use crate::util::id_filter;

/* ================== Lookups ================== */

pub(super) async fn find_order(id: &str) -> ApiResult<Option<OrderDto>> {
    Ok(db()?
        .collection::<Document>(ORDERS)
        .find_one(id_filter(id), None)
        .await?
        .map(|d| doc_to_order(&d)))
}

async fn visible_order(user: &AuthUser, id: &str) -> ApiResult<OrderDto> {
    let order = find_order(id).await?.ok_or(ApiError::NotFound("Order"))?;
    // Other users' orders read as missing rather than forbidden.
    if order.user_id != user.id && !user.is_admin() {
        return Err(ApiError::NotFound("Order"));
    }
    Ok(order)
}

/* ================== State transitions ================== */

pub(super) async fn mark_paid(order_id: &str, payment_ref: Option<&str>) -> ApiResult<bool> {
    checkout::mark_paid(&MongoStore::connect()?, order_id, payment_ref).await
}

pub(super) async fn cancel_pending(order: &OrderDto) -> ApiResult<bool> {
    checkout::cancel_order(&MongoStore::connect()?, order).await
}

/* ================== Checkout ================== */

#[derive(Deserialize)]
pub struct CheckoutReq {
    pub payment_method: Option<String>,
    pub shipping_address: ShippingAddress,
}

#[derive(Serialize)]
pub struct CheckoutResp {
    pub order: OrderDto,
    /// Hosted payment page for card methods.
    pub redirect_url: Option<String>,
}

fn split_name(full: &str) -> (&str, &str) {
    let full = full.trim();
    match full.split_once(' ') {
        Some((first, last)) => (first, last.trim()),
        None => (full, ""),
    }
}

pub async fn order_checkout(
    State(ctx): State<SharedCtx>,
    user: AuthUser,
    ApiJson(req): ApiJson<CheckoutReq>,
) -> ApiResult<(StatusCode, Json<CheckoutResp>)> {
    let method = match req.payment_method.as_deref() {
        None => PaymentMethod::Cash,
        Some(raw) => PaymentMethod::parse(raw)
            .ok_or_else(|| ApiError::validation(format!("Unknown payment method {raw}")))?,
    };
    req.shipping_address.validate()?;

    let paymob_cfg = match method {
        PaymentMethod::Paymob => Some(
            ctx.config
                .paymob
                .as_ref()
                .ok_or_else(|| ApiError::validation("Paymob payments are not available"))?,
        ),
        _ => None,
    };
    let stripe_cfg = match method {
        PaymentMethod::Stripe => Some(
            ctx.config
                .stripe
                .as_ref()
                .ok_or_else(|| ApiError::validation("Stripe payments are not available"))?,
        ),
        _ => None,
    };

    let cart = find_cart(&user.id)
        .await?
        .ok_or_else(|| ApiError::validation("Cart is empty"))?;
    let mut order = OrderDto::from_cart(
        Uuid::new_v4().to_string(),
        &cart,
        method,
        req.shipping_address,
        ctx.config.tax_price,
        ctx.config.shipping_price,
    )?;

    let store = MongoStore::connect()?;
    checkout::place_order(&store, &cart.id, &order).await?;
    info!(
        target: "orders",
        "order {} placed by {} total={} method={}",
        order.id, user.id, order.total_order_price, method.as_str()
    );

    let redirect = if let Some(cfg) = paymob_cfg {
        let (first_name, last_name) = split_name(&user.name);
        let billing = BillingData {
            first_name,
            last_name,
            email: &user.email,
            phone_number: &order.shipping_address.phone,
            street: &order.shipping_address.details,
            city: &order.shipping_address.city,
            postal_code: order.shipping_address.postal_code.as_deref(),
        };
        PaymobClient::new(&ctx.http, cfg)
            .checkout(&order.id, order.total_order_price, &ctx.config.currency, &billing)
            .await
            .map(|c| Some((c.paymob_order_id, c.redirect_url)))
    } else if let Some(cfg) = stripe_cfg {
        let base = ctx.config.public_base_url.trim_end_matches('/');
        StripeClient::new(&ctx.http, cfg)
            .create_checkout_session(
                &order.id,
                order.total_order_price,
                &ctx.config.currency,
                &user.email,
                &format!("{base}/checkout/success?order={}", order.id),
                &format!("{base}/checkout/cancel?order={}", order.id),
            )
            .await
            .map(|s| Some((s.id, s.url.unwrap_or_default())))
    } else {
        Ok(None)
    };

    let redirect_url = match redirect {
        Ok(None) => None,
        Ok(Some((payment_ref, url))) => {
            store.set_payment_ref(&order.id, &payment_ref).await?;
            order.payment_ref = Some(payment_ref);
            Some(url)
        }
        Err(e) => {
            warn!(target: "payments", "payment setup for order {} failed: {e}", order.id);
            checkout::abandon_checkout(&store, &cart.id, &order).await;
            return Err(e);
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(CheckoutResp {
            order,
            redirect_url,
        }),
    ))
}

/* ================== Queries ================== */

pub async fn orders_list(user: AuthUser) -> ApiResult<Json<Vec<OrderDto>>> {
    let filter = if user.is_admin() {
        Document::new()
    } else {
        doc! { "user_id": &user.id }
    };
    let docs: Vec<Document> = db()?
        .collection::<Document>(ORDERS)
        .find(filter, sort_created_at_desc())
        .await?
        .try_collect()
        .await?;
    Ok(Json(docs.iter().map(doc_to_order).collect()))
}

pub async fn order_get(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OrderDto>> {
    Ok(Json(visible_order(&user, &id).await?))
}

/* ================== Admin & owner actions ================== */

pub async fn order_mark_paid(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OrderDto>> {
    user.require_admin()?;
    let order = find_order(&id).await?.ok_or(ApiError::NotFound("Order"))?;
    if !order.status.can_become(OrderStatus::Paid, order.payment_method) {
        return Err(transition_error(&order, OrderStatus::Paid));
    }
    if !mark_paid(&order.id, None).await? {
        return Err(transition_error(&order, OrderStatus::Paid));
    }
    let updated = find_order(&id).await?.ok_or(ApiError::NotFound("Order"))?;
    Ok(Json(updated))
}

pub async fn order_mark_delivered(
    user: AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<OrderDto>> {
    user.require_admin()?;
    let order = find_order(&id).await?.ok_or(ApiError::NotFound("Order"))?;
    checkout::deliver(&MongoStore::connect()?, &order).await?;
    let updated = find_order(&id).await?.ok_or(ApiError::NotFound("Order"))?;
    Ok(Json(updated))
}

pub async fn order_cancel(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OrderDto>> {
    let order = visible_order(&user, &id).await?;
    if !order.status.can_become(OrderStatus::Cancelled, order.payment_method) {
        return Err(transition_error(&order, OrderStatus::Cancelled));
    }
    if !cancel_pending(&order).await? {
        return Err(transition_error(&order, OrderStatus::Cancelled));
    }
    let updated = find_order(&id).await?.ok_or(ApiError::NotFound("Order"))?;
    Ok(Json(updated))
}

#[cfg(test)]
mod tests {
    use super::split_name;

    #[test]
    fn names_split_on_first_space() {
        assert_eq!(split_name("Ada Lovelace"), ("Ada", "Lovelace"));
        assert_eq!(split_name(" Mary Ann Evans "), ("Mary", "Ann Evans"));
        assert_eq!(split_name("Plato"), ("Plato", ""));
    }
}
