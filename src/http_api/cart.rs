use axum::{
    extract::{Path, Query},
    Json,
};
use mongodb::bson::{doc, Document};
use serde::Deserialize;
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::{coupons::find_by_code, ApiJson, AuthUser, OkMsg, OK};
use crate::cart::{cart_to_doc, doc_to_cart, CartDto};
use crate::catalog::{doc_to_product, ProductDto};
use crate::error::{ApiError, ApiResult};
use crate::mongo::{db, CARTS, PRODUCTS};
use crate::util::{live_id_filter, now_iso_rfc3339};

fn active_cart_filter(user_id: &str) -> Document {
    doc! { "user_id": user_id, "is_deleted": { "$ne": true } }
}

/// The caller's open cart, if any.
pub(super) async fn find_cart(user_id: &str) -> ApiResult<Option<CartDto>> {
    Ok(db()?
        .collection::<Document>(CARTS)
        .find_one(active_cart_filter(user_id), None)
        .await?
        .map(|d| doc_to_cart(&d)))
}

/// A cart loaded for editing; `stored` is false until the first save.
struct EditCart {
    cart: CartDto,
    stored: bool,
}

async fn load_or_new(user_id: &str) -> ApiResult<EditCart> {
    Ok(match find_cart(user_id).await? {
        Some(cart) => EditCart { cart, stored: true },
        None => EditCart {
            cart: CartDto::new(Uuid::new_v4().to_string(), user_id.to_string()),
            stored: false,
        },
    })
}

async fn load_existing(user_id: &str) -> ApiResult<EditCart> {
    let cart = find_cart(user_id).await?.ok_or(ApiError::NotFound("Cart"))?;
    Ok(EditCart { cart, stored: true })
}

/// Writes the cart back only while it is still open. A cart checked out
/// in the meantime is never resurrected.
async fn save(edit: &EditCart) -> ApiResult<()> {
    let coll = db()?.collection::<Document>(CARTS);
    if !edit.stored {
        coll.insert_one(cart_to_doc(&edit.cart), None).await?;
        return Ok(());
    }
    let res = coll
        .replace_one(
            doc! { "_id": &edit.cart.id, "is_deleted": { "$ne": true } },
            cart_to_doc(&edit.cart),
            None,
        )
        .await?;
    if res.matched_count == 0 {
        return Err(ApiError::conflict("Cart was checked out, reload it"));
    }
    Ok(())
}

async fn live_product(product_id: &str) -> ApiResult<ProductDto> {
    let d = db()?
        .collection::<Document>(PRODUCTS)
        .find_one(live_id_filter(product_id), None)
        .await?
        .ok_or(ApiError::NotFound("Product"))?;
    Ok(doc_to_product(&d))
}

fn ensure_stock(product: &ProductDto, wanted: i64) -> ApiResult<()> {
    if wanted > product.stock {
        return Err(ApiError::conflict(format!(
            "Only {} of {} left in stock",
            product.stock, product.title
        )));
    }
    Ok(())
}

pub async fn cart_get(user: AuthUser) -> ApiResult<Json<CartDto>> {
    Ok(Json(load_or_new(&user.id).await?.cart))
}

#[derive(Deserialize)]
pub struct AddItemReq {
    pub product_id: String,
    pub quantity: Option<i64>,
    pub color: Option<String>,
}

pub async fn cart_add(user: AuthUser, ApiJson(req): ApiJson<AddItemReq>) -> ApiResult<Json<CartDto>> {
    let quantity = req.quantity.unwrap_or(1);
    let product = live_product(&req.product_id).await?;
    let color = req
        .color
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());
    if let Some(c) = &color {
        if !product.colors.is_empty() && !product.colors.iter().any(|pc| pc.eq_ignore_ascii_case(c)) {
            return Err(ApiError::validation(format!("Color {c} is not offered for this product")));
        }
    }

    let mut edit = load_or_new(&user.id).await?;
    ensure_stock(&product, edit.cart.quantity_of(&product.id) + quantity)?;
    edit.cart.add_item(
        &product.id,
        &product.title,
        product.effective_price(),
        quantity,
        color,
    )?;
    save(&edit).await?;
    info!(target: "cart", "user {} added {quantity} x {}", user.id, product.id);
    Ok(Json(edit.cart))
}

#[derive(Deserialize)]
pub struct QuantityReq {
    pub quantity: i64,
    /// Picks the line when the product is in the cart in several colors.
    pub color: Option<String>,
}

pub async fn cart_set_quantity(
    user: AuthUser,
    Path(product_id): Path<String>,
    ApiJson(req): ApiJson<QuantityReq>,
) -> ApiResult<Json<CartDto>> {
    let mut edit = load_existing(&user.id).await?;
    let product = live_product(&product_id).await?;
    let color = req.color.as_deref();
    let elsewhere = edit.cart.quantity_elsewhere(&product_id, color)?;
    ensure_stock(&product, elsewhere + req.quantity)?;
    edit.cart.set_quantity(&product_id, color, req.quantity)?;
    save(&edit).await?;
    Ok(Json(edit.cart))
}

#[derive(Deserialize)]
pub struct LineQuery {
    pub color: Option<String>,
}

/// Without `?color=` every line of the product is removed.
pub async fn cart_remove(
    user: AuthUser,
    Path(product_id): Path<String>,
    Query(line): Query<LineQuery>,
) -> ApiResult<Json<CartDto>> {
    let mut edit = load_existing(&user.id).await?;
    edit.cart.remove_item(&product_id, line.color.as_deref())?;
    save(&edit).await?;
    Ok(Json(edit.cart))
}

pub async fn cart_clear(user: AuthUser) -> ApiResult<Json<OkMsg>> {
    db()?
        .collection::<Document>(CARTS)
        .update_many(
            active_cart_filter(&user.id),
            doc! { "$set": { "is_deleted": true, "deleted_at": now_iso_rfc3339() } },
            None,
        )
        .await?;
    Ok(Json(OK))
}

#[derive(Deserialize)]
pub struct ApplyCouponReq {
    pub code: String,
}

pub async fn cart_apply_coupon(
    user: AuthUser,
    ApiJson(req): ApiJson<ApplyCouponReq>,
) -> ApiResult<Json<CartDto>> {
    let mut edit = load_existing(&user.id).await?;
    if edit.cart.items.is_empty() {
        return Err(ApiError::validation("Cart is empty"));
    }
    let coupon = find_by_code(&req.code).await?;
    let discount = coupon.apply(edit.cart.total_cart_price, OffsetDateTime::now_utc())?;
    edit.cart.apply_discount(&coupon.code, discount);
    save(&edit).await?;
    info!(target: "cart", "user {} applied coupon {}", user.id, coupon.code);
    Ok(Json(edit.cart))
}
