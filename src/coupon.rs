use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{ApiError, ApiResult};
use crate::util::{
    bool_from, f64_from, i64_from, id_of, now_iso_rfc3339, opt_f64, opt_f64_bson, opt_i64,
    opt_string, parse_rfc3339, round2, str_from,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscountKind {
    Percentage,
    Fixed,
}

impl DiscountKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscountKind::Percentage => "percentage",
            DiscountKind::Fixed => "fixed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "percentage" | "percent" => Some(DiscountKind::Percentage),
            "fixed" => Some(DiscountKind::Fixed),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CouponDto {
    pub id: String,
    pub code: String,
    pub kind: DiscountKind,
    pub value: f64,
    pub max_discount_amount: Option<f64>,
    /// RFC 3339 instant after which the coupon stops working.
    pub expire: String,
    pub max_uses: Option<i64>,
    pub used_count: i64,
    pub is_active: bool,
    pub is_deleted: bool,
    pub created_at: String,
}

/// Why a coupon cannot be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Inactive,
    Deleted,
    Expired,
    Exhausted,
}

impl Rejection {
    pub fn message(self) -> &'static str {
        match self {
            Rejection::Inactive => "Coupon is not active",
            Rejection::Deleted => "Coupon no longer exists",
            Rejection::Expired => "Coupon has expired",
            Rejection::Exhausted => "Coupon usage limit reached",
        }
    }
}

impl CouponDto {
    pub fn check(&self, now: OffsetDateTime) -> Result<(), Rejection> {
        if self.is_deleted {
            return Err(Rejection::Deleted);
        }
        if !self.is_active {
            return Err(Rejection::Inactive);
        }
        // An unparsable expiry counts as expired.
        match parse_rfc3339(&self.expire) {
            Some(exp) if exp > now => {}
            _ => return Err(Rejection::Expired),
        }
        if let Some(max) = self.max_uses {
            if self.used_count >= max {
                return Err(Rejection::Exhausted);
            }
        }
        Ok(())
    }

    pub fn discount_for(&self, order_amount: f64) -> f64 {
        let amount = order_amount.max(0.0);
        let raw = match self.kind {
            DiscountKind::Percentage => {
                let pct = amount * self.value / 100.0;
                match self.max_discount_amount {
                    Some(cap) => pct.min(cap),
                    None => pct,
                }
            }
            DiscountKind::Fixed => self.value.min(amount),
        };
        round2(raw.max(0.0))
    }

    /// Validates and returns the discount for `order_amount`.
    pub fn apply(&self, order_amount: f64, now: OffsetDateTime) -> ApiResult<f64> {
        self.check(now)
            .map_err(|r| ApiError::validation(r.message()))?;
        Ok(self.discount_for(order_amount))
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Shape checks shared by create and update.
pub fn validate_terms(
    kind: DiscountKind,
    value: f64,
    max_discount_amount: Option<f64>,
    max_uses: Option<i64>,
) -> ApiResult<()> {
    match kind {
        DiscountKind::Percentage if !(value > 0.0 && value <= 100.0) => {
            return Err(ApiError::validation(
                "Percentage discount must be within (0, 100]",
            ))
        }
        DiscountKind::Fixed if value <= 0.0 => {
            return Err(ApiError::validation("Fixed discount must be positive"))
        }
        _ => {}
    }
    if matches!(max_discount_amount, Some(cap) if cap <= 0.0) {
        return Err(ApiError::validation("max_discount_amount must be positive"));
    }
    if matches!(max_uses, Some(n) if n < 1) {
        return Err(ApiError::validation("max_uses must be at least 1"));
    }
    Ok(())
}

/// Filter matching a redeemable coupon by code; the usage ceiling is part of
/// the filter so the `$inc` on `used_count` cannot overshoot.
pub fn redeem_filter(code: &str, now_rfc3339: &str) -> Document {
    doc! {
        "code": code,
        "is_active": true,
        "is_deleted": { "$ne": true },
        "expire": { "$gt": now_rfc3339 },
        "$or": [
            { "max_uses": Bson::Null },
            { "$expr": { "$lt": ["$used_count", "$max_uses"] } },
        ],
    }
}

/* ================== BSON mapping ================== */

pub fn coupon_to_doc(c: &CouponDto) -> Document {
    doc! {
        "_id": &c.id,
        "id": &c.id,
        "code": &c.code,
        "kind": c.kind.as_str(),
        "value": Bson::from(c.value),
        "max_discount_amount": opt_f64_bson(c.max_discount_amount),
        "expire": &c.expire,
        "max_uses": c.max_uses.map(Bson::Int64).unwrap_or(Bson::Null),
        "used_count": Bson::Int64(c.used_count),
        "is_active": c.is_active,
        "is_deleted": c.is_deleted,
        "created_at": &c.created_at,
    }
}

pub fn doc_to_coupon(d: &Document) -> CouponDto {
    CouponDto {
        id: id_of(d),
        code: str_from(d, "code"),
        kind: d
            .get_str("kind")
            .ok()
            .and_then(DiscountKind::parse)
            .unwrap_or(DiscountKind::Fixed),
        value: f64_from(d, "value"),
        max_discount_amount: opt_f64(d, "max_discount_amount"),
        expire: str_from(d, "expire"),
        max_uses: opt_i64(d, "max_uses"),
        used_count: i64_from(d, "used_count"),
        is_active: bool_from(d, "is_active").unwrap_or(true),
        is_deleted: bool_from(d, "is_deleted").unwrap_or(false),
        created_at: opt_string(d, "created_at").unwrap_or_else(now_iso_rfc3339),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::fmt_rfc3339;
    use time::Duration;

    fn coupon(kind: DiscountKind, value: f64) -> CouponDto {
        CouponDto {
            id: "c1".into(),
            code: "SAVE".into(),
            kind,
            value,
            max_discount_amount: None,
            expire: fmt_rfc3339(OffsetDateTime::now_utc() + Duration::days(1)),
            max_uses: None,
            used_count: 0,
            is_active: true,
            is_deleted: false,
            created_at: now_iso_rfc3339(),
        }
    }

    #[test]
    fn percentage_discount_respects_cap() {
        let mut c = coupon(DiscountKind::Percentage, 20.0);
        assert_eq!(c.discount_for(200.0), 40.0);
        c.max_discount_amount = Some(25.0);
        assert_eq!(c.discount_for(200.0), 25.0);
        assert_eq!(c.discount_for(50.0), 10.0);
    }

    #[test]
    fn fixed_discount_is_bounded_by_amount() {
        let c = coupon(DiscountKind::Fixed, 30.0);
        assert_eq!(c.discount_for(100.0), 30.0);
        assert_eq!(c.discount_for(12.0), 12.0);
        assert_eq!(c.discount_for(-5.0), 0.0);
    }

    #[test]
    fn validity_requires_every_condition() {
        let now = OffsetDateTime::now_utc();
        let base = coupon(DiscountKind::Fixed, 5.0);
        assert!(base.check(now).is_ok());

        let mut c = base.clone();
        c.is_active = false;
        assert_eq!(c.check(now), Err(Rejection::Inactive));

        let mut c = base.clone();
        c.is_deleted = true;
        assert_eq!(c.check(now), Err(Rejection::Deleted));

        let mut c = base.clone();
        c.expire = fmt_rfc3339(now - Duration::minutes(1));
        assert_eq!(c.check(now), Err(Rejection::Expired));

        let mut c = base.clone();
        c.expire = "garbage".into();
        assert_eq!(c.check(now), Err(Rejection::Expired));

        let mut c = base.clone();
        c.max_uses = Some(3);
        c.used_count = 2;
        assert!(c.check(now).is_ok());
        c.used_count = 3;
        assert_eq!(c.check(now), Err(Rejection::Exhausted));
    }

    #[test]
    fn expiry_is_exclusive() {
        let now = OffsetDateTime::now_utc().replace_nanosecond(0).unwrap();
        let mut c = coupon(DiscountKind::Fixed, 5.0);
        c.expire = fmt_rfc3339(now);
        assert!(!c.check(now).is_ok());
    }

    #[test]
    fn apply_reports_rejection_reason() {
        let mut c = coupon(DiscountKind::Fixed, 5.0);
        c.is_active = false;
        let err = c.apply(100.0, OffsetDateTime::now_utc()).unwrap_err();
        assert_eq!(err.to_string(), "Coupon is not active");
    }

    #[test]
    fn terms_validation() {
        assert!(validate_terms(DiscountKind::Percentage, 0.0, None, None).is_err());
        assert!(validate_terms(DiscountKind::Percentage, 101.0, None, None).is_err());
        assert!(validate_terms(DiscountKind::Percentage, 100.0, Some(10.0), Some(1)).is_ok());
        assert!(validate_terms(DiscountKind::Fixed, -1.0, None, None).is_err());
        assert!(validate_terms(DiscountKind::Fixed, 5.0, None, Some(0)).is_err());
        assert!(validate_terms(DiscountKind::Fixed, 5.0, Some(0.0), None).is_err());
    }

    #[test]
    fn document_mapping_keeps_optional_limits() {
        let mut c = coupon(DiscountKind::Percentage, 15.0);
        c.max_uses = Some(10);
        c.used_count = 4;
        let back = doc_to_coupon(&coupon_to_doc(&c));
        assert_eq!(back.kind, DiscountKind::Percentage);
        assert_eq!(back.max_uses, Some(10));
        assert_eq!(back.used_count, 4);
        assert_eq!(back.max_discount_amount, None);
    }

    #[test]
    fn codes_are_uppercased() {
        assert_eq!(normalize_code(" save10 "), "SAVE10");
    }
}
