use time::OffsetDateTime;
use tracing::{error, info, warn};

use crate::cart::CartItem;
use crate::error::{ApiError, ApiResult};
use crate::order::{OrderDto, OrderStatus};
use crate::store::Store;
use crate::util::fmt_rfc3339_secs;

/// Per-product quantities; the same product may appear on several lines (colors).
fn quantities(items: &[CartItem]) -> Vec<(String, i64)> {
    let mut out: Vec<(String, i64)> = vec![];
    for item in items {
        match out.iter_mut().find(|(id, _)| *id == item.product_id) {
            Some((_, q)) => *q += item.quantity,
            None => out.push((item.product_id.clone(), item.quantity)),
        }
    }
    out
}

async fn give_back(store: &dyn Store, taken: &[(String, i64)]) {
    for (product_id, qty) in taken {
        if let Err(e) = store.return_stock(product_id, *qty).await {
            error!(target: "inventory", "rollback of {qty} x {product_id} failed: {e}");
        }
    }
    if !taken.is_empty() {
        info!(target: "inventory", "rolled back {} reservations", taken.len());
    }
}

/// Takes stock for every line or for none of them.
pub async fn reserve_stock(store: &dyn Store, items: &[CartItem]) -> ApiResult<()> {
    let mut taken: Vec<(String, i64)> = vec![];
    for (product_id, qty) in quantities(items) {
        match store.take_stock(&product_id, qty).await {
            Ok(true) => taken.push((product_id, qty)),
            Ok(false) => {
                give_back(store, &taken).await;
                return Err(ApiError::conflict(format!(
                    "Insufficient stock for product {product_id}"
                )));
            }
            Err(e) => {
                give_back(store, &taken).await;
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Puts an order's stock back.
pub async fn restock(store: &dyn Store, items: &[CartItem]) -> ApiResult<()> {
    for (product_id, qty) in quantities(items) {
        store.return_stock(&product_id, qty).await?;
    }
    Ok(())
}

async fn reopen(store: &dyn Store, cart_id: &str, user_id: &str) {
    match store.reopen_cart(cart_id, user_id).await {
        Ok(true) => info!(target: "orders", "cart {cart_id} reopened"),
        Ok(false) => warn!(target: "orders", "cart {cart_id} left closed, user has a newer cart"),
        Err(e) => error!(target: "orders", "reopening cart {cart_id} failed: {e}"),
    }
}

async fn release_coupon(store: &dyn Store, code: &str) {
    if let Err(e) = store.return_coupon_use(code).await {
        error!(target: "orders", "coupon {code} release failed: {e}");
    }
}

/// Turns the cart `cart_id` into the stored pending `order`.
///
/// The cart is claimed first so two concurrent checkouts of one cart cannot
/// both succeed. Any later failure gives back what was taken and reopens the
/// cart.
pub async fn place_order(store: &dyn Store, cart_id: &str, order: &OrderDto) -> ApiResult<()> {
    if !store.claim_cart(cart_id).await? {
        return Err(ApiError::conflict("Cart was already checked out"));
    }

    if let Err(e) = reserve_stock(store, &order.items).await {
        reopen(store, cart_id, &order.user_id).await;
        return Err(e);
    }

    if let Some(code) = &order.coupon_code {
        let now = fmt_rfc3339_secs(OffsetDateTime::now_utc());
        let redeemed = match store.take_coupon_use(code, &now).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ApiError::conflict(format!("Coupon {code} can no longer be used"))),
            Err(e) => Err(e),
        };
        if let Err(e) = redeemed {
            give_back(store, &quantities(&order.items)).await;
            reopen(store, cart_id, &order.user_id).await;
            return Err(e);
        }
    }

    if let Err(e) = store.insert_order(order).await {
        give_back(store, &quantities(&order.items)).await;
        if let Some(code) = &order.coupon_code {
            release_coupon(store, code).await;
        }
        reopen(store, cart_id, &order.user_id).await;
        return Err(e);
    }
    Ok(())
}

/// Pending -> paid. `false` when the order was no longer pending, which makes
/// repeated provider callbacks harmless.
pub async fn mark_paid(
    store: &dyn Store,
    order_id: &str,
    payment_ref: Option<&str>,
) -> ApiResult<bool> {
    let moved = store
        .transition_order(order_id, OrderStatus::Pending, OrderStatus::Paid, payment_ref)
        .await?;
    if moved {
        info!(target: "orders", "order {order_id} paid");
    }
    Ok(moved)
}

pub fn transition_error(order: &OrderDto, next: OrderStatus) -> ApiError {
    ApiError::conflict(format!(
        "Order is {} and cannot become {}",
        order.status.as_str(),
        next.as_str()
    ))
}

/// Delivering a cash order also records the payment collected on delivery.
pub async fn deliver(store: &dyn Store, order: &OrderDto) -> ApiResult<()> {
    if !order.status.can_become(OrderStatus::Delivered, order.payment_method) {
        return Err(transition_error(order, OrderStatus::Delivered));
    }
    if !store
        .transition_order(&order.id, order.status, OrderStatus::Delivered, None)
        .await?
    {
        return Err(ApiError::conflict("Order was modified concurrently"));
    }
    info!(target: "orders", "order {} delivered", order.id);
    Ok(())
}

/// Cancels a pending order and gives back its stock and coupon use.
/// `false` when the order had already left pending.
pub async fn cancel_order(store: &dyn Store, order: &OrderDto) -> ApiResult<bool> {
    if !store
        .transition_order(&order.id, OrderStatus::Pending, OrderStatus::Cancelled, None)
        .await?
    {
        return Ok(false);
    }
    restock(store, &order.items).await?;
    if let Some(code) = &order.coupon_code {
        store.return_coupon_use(code).await?;
    }
    info!(target: "orders", "order {} cancelled, stock returned", order.id);
    Ok(true)
}

/// Undoes a placed order whose payment could not be set up, handing the
/// cart back to the user.
pub async fn abandon_checkout(store: &dyn Store, cart_id: &str, order: &OrderDto) {
    match cancel_order(store, order).await {
        Ok(true) => reopen(store, cart_id, &order.user_id).await,
        Ok(false) => warn!(target: "orders", "order {} already left pending, kept as is", order.id),
        Err(e) => error!(target: "orders", "cancel of order {} failed: {e}", order.id),
    }
}
