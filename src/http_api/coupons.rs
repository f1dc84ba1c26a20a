use axum::{extract::Path, http::StatusCode, Json};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use super::{ApiJson, AuthUser, OkMsg, OK};
use crate::coupon::{
    coupon_to_doc, doc_to_coupon, normalize_code, validate_terms, CouponDto, DiscountKind,
};
use crate::error::{ApiError, ApiResult};
use crate::mongo::{conflict_on_duplicate, db, soft_delete, sort_created_at_desc, COUPONS};
use crate::util::{
    fmt_rfc3339_secs, live_id_filter, now_iso_rfc3339, opt_f64_bson, parse_rfc3339, round2,
};

#[derive(Deserialize)]
pub struct CouponCreateReq {
    pub code: String,
    pub kind: DiscountKind,
    pub value: f64,
    pub max_discount_amount: Option<f64>,
    pub expire: String,
    pub max_uses: Option<i64>,
    pub is_active: Option<bool>,
}

#[derive(Deserialize)]
pub struct CouponUpdateReq {
    pub kind: Option<DiscountKind>,
    pub value: Option<f64>,
    pub max_discount_amount: Option<f64>,
    pub expire: Option<String>,
    pub max_uses: Option<i64>,
    pub is_active: Option<bool>,
    /// Removes the percentage cap; wins over `max_discount_amount`.
    #[serde(default)]
    pub clear_max_discount: bool,
    /// Makes the coupon unlimited; wins over `max_uses`.
    #[serde(default)]
    pub clear_max_uses: bool,
}

/// Discount terms after an update: (kind, value, cap, max uses).
/// Absent fields keep their current value, `clear_*` flags null them.
fn merged_terms(
    current: &CouponDto,
    req: &CouponUpdateReq,
) -> (DiscountKind, f64, Option<f64>, Option<i64>) {
    let kind = req.kind.unwrap_or(current.kind);
    let value = req.value.unwrap_or(current.value);
    let cap = if req.clear_max_discount {
        None
    } else {
        req.max_discount_amount.or(current.max_discount_amount)
    };
    let max_uses = if req.clear_max_uses {
        None
    } else {
        req.max_uses.or(current.max_uses)
    };
    (kind, value, cap, max_uses)
}

fn parse_expiry(raw: &str) -> ApiResult<String> {
    let t = parse_rfc3339(raw)
        .ok_or_else(|| ApiError::validation("expire must be an RFC 3339 timestamp"))?;
    if t <= OffsetDateTime::now_utc() {
        return Err(ApiError::validation("expire must be in the future"));
    }
    Ok(fmt_rfc3339_secs(t))
}

/// Live coupon by its code.
pub(super) async fn find_by_code(code: &str) -> ApiResult<CouponDto> {
    let d = db()?
        .collection::<Document>(COUPONS)
        .find_one(
            doc! { "code": normalize_code(code), "is_deleted": { "$ne": true } },
            None,
        )
        .await?
        .ok_or(ApiError::NotFound("Coupon"))?;
    Ok(doc_to_coupon(&d))
}

pub async fn coupons_list(user: AuthUser) -> ApiResult<Json<Vec<CouponDto>>> {
    user.require_admin()?;
    let docs: Vec<Document> = db()?
        .collection::<Document>(COUPONS)
        .find(doc! { "is_deleted": { "$ne": true } }, sort_created_at_desc())
        .await?
        .try_collect()
        .await?;
    Ok(Json(docs.iter().map(doc_to_coupon).collect()))
}

pub async fn coupon_get(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<CouponDto>> {
    user.require_admin()?;
    let d = db()?
        .collection::<Document>(COUPONS)
        .find_one(live_id_filter(&id), None)
        .await?
        .ok_or(ApiError::NotFound("Coupon"))?;
    Ok(Json(doc_to_coupon(&d)))
}

pub async fn coupon_add(
    user: AuthUser,
    ApiJson(req): ApiJson<CouponCreateReq>,
) -> ApiResult<(StatusCode, Json<CouponDto>)> {
    user.require_admin()?;
    let code = normalize_code(&req.code);
    if code.len() < 3 {
        return Err(ApiError::validation("Coupon code must be at least 3 characters"));
    }
    validate_terms(req.kind, req.value, req.max_discount_amount, req.max_uses)?;

    let dto = CouponDto {
        id: Uuid::new_v4().to_string(),
        code,
        kind: req.kind,
        value: req.value,
        max_discount_amount: match req.kind {
            DiscountKind::Percentage => req.max_discount_amount,
            DiscountKind::Fixed => None,
        },
        expire: parse_expiry(&req.expire)?,
        max_uses: req.max_uses,
        used_count: 0,
        is_active: req.is_active.unwrap_or(true),
        is_deleted: false,
        created_at: now_iso_rfc3339(),
    };
    db()?
        .collection::<Document>(COUPONS)
        .insert_one(coupon_to_doc(&dto), None)
        .await
        .map_err(|e| conflict_on_duplicate(e, "Coupon code"))?;
    info!(target: "coupons", "coupon {} created", dto.code);
    Ok((StatusCode::CREATED, Json(dto)))
}

pub async fn coupon_update(
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<CouponUpdateReq>,
) -> ApiResult<Json<CouponDto>> {
    user.require_admin()?;
    let coll = db()?.collection::<Document>(COUPONS);
    let current = coll
        .find_one(live_id_filter(&id), None)
        .await?
        .map(|d| doc_to_coupon(&d))
        .ok_or(ApiError::NotFound("Coupon"))?;

    let (kind, value, cap, max_uses) = merged_terms(&current, &req);
    validate_terms(kind, value, cap, max_uses)?;

    let mut set_doc = doc! {
        "kind": kind.as_str(),
        "value": Bson::from(value),
        "max_discount_amount": opt_f64_bson(match kind {
            DiscountKind::Percentage => cap,
            DiscountKind::Fixed => None,
        }),
        "max_uses": max_uses.map(Bson::Int64).unwrap_or(Bson::Null),
    };
    if let Some(expire) = req.expire {
        set_doc.insert("expire", parse_expiry(&expire)?);
    }
    if let Some(active) = req.is_active {
        set_doc.insert("is_active", active);
    }
    coll.update_one(live_id_filter(&id), doc! { "$set": set_doc }, None)
        .await?;

    let d = coll
        .find_one(live_id_filter(&id), None)
        .await?
        .ok_or(ApiError::NotFound("Coupon"))?;
    Ok(Json(doc_to_coupon(&d)))
}

pub async fn coupon_delete(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OkMsg>> {
    user.require_admin()?;
    if !soft_delete(db()?, COUPONS, &id).await? {
        return Err(ApiError::NotFound("Coupon"));
    }
    Ok(Json(OK))
}

/* ---- validate against an amount ---- */

#[derive(Deserialize)]
pub struct ValidateReq {
    pub code: String,
    pub amount: f64,
}

#[derive(Serialize)]
pub struct ValidateResp {
    pub code: String,
    pub discount: f64,
    pub total: f64,
}

pub async fn coupon_validate(
    _user: AuthUser,
    ApiJson(req): ApiJson<ValidateReq>,
) -> ApiResult<Json<ValidateResp>> {
    if !req.amount.is_finite() || req.amount < 0.0 {
        return Err(ApiError::validation("amount must be a non-negative number"));
    }
    let coupon = find_by_code(&req.code).await?;
    let discount = coupon.apply(req.amount, OffsetDateTime::now_utc())?;
    Ok(Json(ValidateResp {
        code: coupon.code,
        discount,
        total: round2(req.amount - discount),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current() -> CouponDto {
        CouponDto {
            id: "c1".into(),
            code: "SAVE20".into(),
            kind: DiscountKind::Percentage,
            value: 20.0,
            max_discount_amount: Some(50.0),
            expire: "2030-01-01T00:00:00Z".into(),
            max_uses: Some(100),
            used_count: 3,
            is_active: true,
            is_deleted: false,
            created_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    fn update(body: serde_json::Value) -> CouponUpdateReq {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn absent_fields_keep_current_terms() {
        let terms = merged_terms(&current(), &update(serde_json::json!({ "value": 15.0 })));
        assert_eq!(terms, (DiscountKind::Percentage, 15.0, Some(50.0), Some(100)));
    }

    #[test]
    fn clear_flags_remove_cap_and_limit() {
        let req = update(serde_json::json!({
            "clear_max_discount": true,
            "clear_max_uses": true,
            "max_uses": 7
        }));
        let (_, _, cap, max_uses) = merged_terms(&current(), &req);
        assert_eq!(cap, None);
        assert_eq!(max_uses, None);
    }

    #[test]
    fn new_limits_replace_old_ones() {
        let req = update(serde_json::json!({ "max_discount_amount": 10.0, "max_uses": 5 }));
        let (_, _, cap, max_uses) = merged_terms(&current(), &req);
        assert_eq!(cap, Some(10.0));
        assert_eq!(max_uses, Some(5));
    }
}
