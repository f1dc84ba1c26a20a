use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::cart::{item_to_doc, items_from, CartDto, CartItem};
use crate::error::{ApiError, ApiResult};
use crate::util::{
    bool_from, f64_from, id_of, now_iso_rfc3339, opt_bson, opt_string, round2, str_from,
};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Paymob,
    Stripe,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Paymob => "paymob",
            PaymentMethod::Stripe => "stripe",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Some(PaymentMethod::Cash),
            "paymob" | "card" => Some(PaymentMethod::Paymob),
            "stripe" => Some(PaymentMethod::Stripe),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "paid" => Some(OrderStatus::Paid),
            "delivered" => Some(OrderStatus::Delivered),
            "cancelled" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Allowed lifecycle moves. Cash orders may be delivered before payment
    /// is collected.
    pub fn can_become(self, next: OrderStatus, method: PaymentMethod) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Paid) | (Pending, Cancelled) | (Paid, Delivered) => true,
            (Pending, Delivered) => method == PaymentMethod::Cash,
            _ => false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ShippingAddress {
    pub details: String,
    pub phone: String,
    pub city: String,
    pub postal_code: Option<String>,
}

impl ShippingAddress {
    pub fn validate(&self) -> ApiResult<()> {
        if self.details.trim().is_empty() || self.city.trim().is_empty() {
            return Err(ApiError::validation("Shipping address details and city are required"));
        }
        let digits = self.phone.chars().filter(|c| c.is_ascii_digit()).count();
        if !(7..=15).contains(&digits) {
            return Err(ApiError::validation("Shipping phone number is invalid"));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct OrderDto {
    pub id: String,
    pub user_id: String,
    pub items: Vec<CartItem>,
    pub shipping_address: ShippingAddress,
    pub items_price: f64,
    pub coupon_code: Option<String>,
    pub tax_price: f64,
    pub shipping_price: f64,
    pub total_order_price: f64,
    pub payment_method: PaymentMethod,
    pub status: OrderStatus,
    pub is_paid: bool,
    pub paid_at: Option<String>,
    pub is_delivered: bool,
    pub delivered_at: Option<String>,
    pub payment_ref: Option<String>,
    pub created_at: String,
}

impl OrderDto {
    /// Freezes the cart into a new pending order.
    pub fn from_cart(
        id: String,
        cart: &CartDto,
        method: PaymentMethod,
        address: ShippingAddress,
        tax_price: f64,
        shipping_price: f64,
    ) -> ApiResult<Self> {
        if cart.items.is_empty() {
            return Err(ApiError::validation("Cart is empty"));
        }
        let items_price = cart.payable();
        Ok(OrderDto {
            id,
            user_id: cart.user_id.clone(),
            items: cart.items.clone(),
            shipping_address: address,
            items_price,
            coupon_code: cart.coupon_code.clone(),
            tax_price,
            shipping_price,
            total_order_price: round2(items_price + tax_price + shipping_price),
            payment_method: method,
            status: OrderStatus::Pending,
            is_paid: false,
            paid_at: None,
            is_delivered: false,
            delivered_at: None,
            payment_ref: None,
            created_at: now_iso_rfc3339(),
        })
    }

    pub fn payment_settled(&self) -> bool {
        matches!(self.status, OrderStatus::Cancelled | OrderStatus::Delivered) || self.is_paid
    }
}

/// `$set` fields that move an order from `from` to `to`. Delivering an
/// unpaid order records the cash collected on delivery.
pub fn transition_fields(
    from: OrderStatus,
    to: OrderStatus,
    now: &str,
    payment_ref: Option<&str>,
) -> Document {
    let mut set = doc! { "status": to.as_str() };
    match to {
        OrderStatus::Paid => {
            set.insert("is_paid", true);
            set.insert("paid_at", now);
        }
        OrderStatus::Delivered => {
            set.insert("is_delivered", true);
            set.insert("delivered_at", now);
            if from == OrderStatus::Pending {
                set.insert("is_paid", true);
                set.insert("paid_at", now);
            }
        }
        OrderStatus::Cancelled => {
            set.insert("cancelled_at", now);
        }
        OrderStatus::Pending => {}
    }
    if let Some(r) = payment_ref {
        set.insert("payment_ref", r);
    }
    set
}

/* ================== BSON mapping ================== */

fn address_to_doc(a: &ShippingAddress) -> Document {
    doc! {
        "details": &a.details,
        "phone": &a.phone,
        "city": &a.city,
        "postal_code": opt_bson(a.postal_code.clone()),
    }
}

fn doc_to_address(d: &Document) -> ShippingAddress {
    ShippingAddress {
        details: str_from(d, "details"),
        phone: str_from(d, "phone"),
        city: str_from(d, "city"),
        postal_code: opt_string(d, "postal_code"),
    }
}

pub fn order_to_doc(o: &OrderDto) -> Document {
    let items: Vec<Bson> = o.items.iter().map(|i| Bson::Document(item_to_doc(i))).collect();
    doc! {
        "_id": &o.id,
        "id": &o.id,
        "user_id": &o.user_id,
        "items": items,
        "shipping_address": address_to_doc(&o.shipping_address),
        "items_price": Bson::from(o.items_price),
        "coupon_code": opt_bson(o.coupon_code.clone()),
        "tax_price": Bson::from(o.tax_price),
        "shipping_price": Bson::from(o.shipping_price),
        "total_order_price": Bson::from(o.total_order_price),
        "payment_method": o.payment_method.as_str(),
        "status": o.status.as_str(),
        "is_paid": o.is_paid,
        "paid_at": opt_bson(o.paid_at.clone()),
        "is_delivered": o.is_delivered,
        "delivered_at": opt_bson(o.delivered_at.clone()),
        "payment_ref": opt_bson(o.payment_ref.clone()),
        "created_at": &o.created_at,
    }
}

pub fn doc_to_order(d: &Document) -> OrderDto {
    OrderDto {
        id: id_of(d),
        user_id: str_from(d, "user_id"),
        items: items_from(d, "items"),
        shipping_address: d
            .get_document("shipping_address")
            .map(doc_to_address)
            .unwrap_or_else(|_| doc_to_address(&Document::new())),
        items_price: f64_from(d, "items_price"),
        coupon_code: opt_string(d, "coupon_code"),
        tax_price: f64_from(d, "tax_price"),
        shipping_price: f64_from(d, "shipping_price"),
        total_order_price: f64_from(d, "total_order_price"),
        payment_method: d
            .get_str("payment_method")
            .ok()
            .and_then(PaymentMethod::parse)
            .unwrap_or(PaymentMethod::Cash),
        status: d
            .get_str("status")
            .ok()
            .and_then(OrderStatus::parse)
            .unwrap_or(OrderStatus::Pending),
        is_paid: bool_from(d, "is_paid").unwrap_or(false),
        paid_at: opt_string(d, "paid_at"),
        is_delivered: bool_from(d, "is_delivered").unwrap_or(false),
        delivered_at: opt_string(d, "delivered_at"),
        payment_ref: opt_string(d, "payment_ref"),
        created_at: opt_string(d, "created_at").unwrap_or_else(now_iso_rfc3339),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address() -> ShippingAddress {
        ShippingAddress {
            details: "12 Nile St".into(),
            phone: "+20 100 123 4567".into(),
            city: "Cairo".into(),
            postal_code: None,
        }
    }

    fn filled_cart() -> CartDto {
        let mut c = CartDto::new("cart-1".into(), "u1".into());
        c.add_item("p1", "Mug", 50.0, 2, None).unwrap();
        c.add_item("p2", "Plate", 25.0, 1, None).unwrap();
        c
    }

    #[test]
    fn snapshot_totals_include_tax_and_shipping() {
        let cart = filled_cart();
        let o = OrderDto::from_cart("o1".into(), &cart, PaymentMethod::Cash, address(), 5.0, 20.0)
            .unwrap();
        assert_eq!(o.items_price, 125.0);
        assert_eq!(o.total_order_price, 150.0);
        assert_eq!(o.status, OrderStatus::Pending);
        assert_eq!(o.items, cart.items);
    }

    #[test]
    fn snapshot_uses_discounted_total() {
        let mut cart = filled_cart();
        cart.apply_discount("TEN", 12.5);
        let o = OrderDto::from_cart("o1".into(), &cart, PaymentMethod::Paymob, address(), 0.0, 0.0)
            .unwrap();
        assert_eq!(o.items_price, 112.5);
        assert_eq!(o.coupon_code.as_deref(), Some("TEN"));
    }

    #[test]
    fn snapshot_is_detached_from_cart() {
        let mut cart = filled_cart();
        let o = OrderDto::from_cart("o1".into(), &cart, PaymentMethod::Cash, address(), 0.0, 0.0)
            .unwrap();
        cart.set_quantity("p1", None, 9).unwrap();
        assert_eq!(o.items[0].quantity, 2);
        assert_eq!(o.items_price, 125.0);
    }

    #[test]
    fn empty_cart_cannot_be_ordered() {
        let cart = CartDto::new("c".into(), "u".into());
        assert!(matches!(
            OrderDto::from_cart("o".into(), &cart, PaymentMethod::Cash, address(), 0.0, 0.0),
            Err(ApiError::Validation(_))
        ));
    }

    #[test]
    fn status_transitions() {
        use OrderStatus::*;
        assert!(Pending.can_become(Paid, PaymentMethod::Stripe));
        assert!(Pending.can_become(Delivered, PaymentMethod::Cash));
        assert!(!Pending.can_become(Delivered, PaymentMethod::Paymob));
        assert!(Paid.can_become(Delivered, PaymentMethod::Paymob));
        assert!(!Paid.can_become(Cancelled, PaymentMethod::Cash));
        assert!(!Cancelled.can_become(Paid, PaymentMethod::Cash));
        assert!(!Delivered.can_become(Cancelled, PaymentMethod::Cash));
    }

    #[test]
    fn address_validation() {
        assert!(address().validate().is_ok());
        let mut a = address();
        a.phone = "12".into();
        assert!(a.validate().is_err());
        let mut a = address();
        a.city = " ".into();
        assert!(a.validate().is_err());
    }

    #[test]
    fn document_mapping_keeps_snapshot() {
        let cart = filled_cart();
        let o = OrderDto::from_cart("o9".into(), &cart, PaymentMethod::Stripe, address(), 1.0, 2.0)
            .unwrap();
        let back = doc_to_order(&order_to_doc(&o));
        assert_eq!(back.id, "o9");
        assert_eq!(back.items, o.items);
        assert_eq!(back.payment_method, PaymentMethod::Stripe);
        assert_eq!(back.shipping_address, o.shipping_address);
        assert_eq!(back.total_order_price, 128.0);
        assert!(!back.payment_settled());
    }

    #[test]
    fn transition_fields_follow_target_status() {
        use OrderStatus::*;
        let paid = transition_fields(Pending, Paid, "t1", Some("cs_1"));
        assert_eq!(paid.get_str("status").unwrap(), "paid");
        assert_eq!(paid.get_bool("is_paid").unwrap(), true);
        assert_eq!(paid.get_str("payment_ref").unwrap(), "cs_1");

        let cash_delivery = transition_fields(Pending, Delivered, "t2", None);
        assert_eq!(cash_delivery.get_bool("is_delivered").unwrap(), true);
        assert_eq!(cash_delivery.get_str("paid_at").unwrap(), "t2");

        let card_delivery = transition_fields(Paid, Delivered, "t3", None);
        assert!(card_delivery.get("paid_at").is_none());

        let cancelled = transition_fields(Pending, Cancelled, "t4", None);
        assert_eq!(cancelled.get_str("cancelled_at").unwrap(), "t4");
        assert!(cancelled.get("is_paid").is_none());
    }

    #[test]
    fn method_parsing_accepts_card_alias() {
        assert_eq!(PaymentMethod::parse("Card"), Some(PaymentMethod::Paymob));
        assert_eq!(PaymentMethod::parse("bitcoin"), None);
    }
}
