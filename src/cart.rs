use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::util::{
    f64_from, i64_from, id_of, now_iso_rfc3339, opt_bson, opt_f64, opt_f64_bson, opt_string,
    round2, str_from,
};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CartItem {
    pub product_id: String,
    pub title: String,
    pub price: f64,
    pub quantity: i64,
    pub color: Option<String>,
}

impl CartItem {
    pub fn line_total(&self) -> f64 {
        self.price * self.quantity as f64
    }

    fn same_line(&self, product_id: &str, color: Option<&str>) -> bool {
        self.product_id == product_id && self.color.as_deref() == color
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct CartDto {
    pub id: String,
    pub user_id: String,
    pub items: Vec<CartItem>,
    pub total_cart_price: f64,
    pub total_after_discount: Option<f64>,
    pub coupon_code: Option<String>,
    pub created_at: String,
}

impl CartDto {
    pub fn new(id: String, user_id: String) -> Self {
        CartDto {
            id,
            user_id,
            items: vec![],
            total_cart_price: 0.0,
            total_after_discount: None,
            coupon_code: None,
            created_at: now_iso_rfc3339(),
        }
    }

    pub fn quantity_of(&self, product_id: &str) -> i64 {
        self.items
            .iter()
            .filter(|i| i.product_id == product_id)
            .map(|i| i.quantity)
            .sum()
    }

    /// Adds `quantity` units; an existing line with the same product and color grows instead.
    pub fn add_item(
        &mut self,
        product_id: &str,
        title: &str,
        unit_price: f64,
        quantity: i64,
        color: Option<String>,
    ) -> ApiResult<()> {
        if quantity < 1 {
            return Err(ApiError::validation("Quantity must be at least 1"));
        }
        match self
            .items
            .iter_mut()
            .find(|i| i.same_line(product_id, color.as_deref()))
        {
            Some(line) => {
                line.quantity += quantity;
                line.price = unit_price;
                line.title = title.to_string();
            }
            None => self.items.push(CartItem {
                product_id: product_id.to_string(),
                title: title.to_string(),
                price: unit_price,
                quantity,
                color,
            }),
        }
        self.recalculate();
        Ok(())
    }

    /// Index of the line a quantity change targets. Without a color the
    /// product must have a single line.
    fn line_index(&self, product_id: &str, color: Option<&str>) -> ApiResult<usize> {
        if color.is_some() {
            return self
                .items
                .iter()
                .position(|i| i.same_line(product_id, color))
                .ok_or(ApiError::NotFound("Cart item"));
        }
        let mut lines = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, i)| i.product_id == product_id);
        match (lines.next(), lines.next()) {
            (None, _) => Err(ApiError::NotFound("Cart item")),
            (Some((idx, _)), None) => Ok(idx),
            (Some(_), Some(_)) => Err(ApiError::validation(
                "Product is in the cart in several colors, specify color",
            )),
        }
    }

    /// Quantity of the product on lines other than the one `color` selects.
    pub fn quantity_elsewhere(&self, product_id: &str, color: Option<&str>) -> ApiResult<i64> {
        let idx = self.line_index(product_id, color)?;
        Ok(self.quantity_of(product_id) - self.items[idx].quantity)
    }

    pub fn set_quantity(
        &mut self,
        product_id: &str,
        color: Option<&str>,
        quantity: i64,
    ) -> ApiResult<()> {
        if quantity < 1 {
            return Err(ApiError::validation("Quantity must be at least 1"));
        }
        let idx = self.line_index(product_id, color)?;
        self.items[idx].quantity = quantity;
        self.recalculate();
        Ok(())
    }

    /// Drops the line for `color`, or every line of the product when no color is given.
    pub fn remove_item(&mut self, product_id: &str, color: Option<&str>) -> ApiResult<()> {
        let before = self.items.len();
        match color {
            Some(_) => self.items.retain(|i| !i.same_line(product_id, color)),
            None => self.items.retain(|i| i.product_id != product_id),
        }
        if self.items.len() == before {
            return Err(ApiError::NotFound("Cart item"));
        }
        self.recalculate();
        Ok(())
    }

    /// Re-derives the total as the exact sum of the lines. Any applied coupon
    /// is dropped because its discount was computed against the previous total.
    pub fn recalculate(&mut self) {
        self.total_cart_price = self.items.iter().map(CartItem::line_total).sum();
        self.total_after_discount = None;
        self.coupon_code = None;
    }

    pub fn apply_discount(&mut self, code: &str, discount: f64) {
        self.total_after_discount = Some(round2((self.total_cart_price - discount).max(0.0)));
        self.coupon_code = Some(code.to_string());
    }

    /// Amount the customer pays for the items.
    pub fn payable(&self) -> f64 {
        self.total_after_discount.unwrap_or(self.total_cart_price)
    }
}

/* ================== BSON mapping ================== */

pub fn item_to_doc(i: &CartItem) -> Document {
    doc! {
        "product_id": &i.product_id,
        "title": &i.title,
        "price": Bson::from(i.price),
        "quantity": Bson::from(i.quantity),
        "color": opt_bson(i.color.clone()),
    }
}

pub fn doc_to_item(d: &Document) -> CartItem {
    CartItem {
        product_id: str_from(d, "product_id"),
        title: str_from(d, "title"),
        price: f64_from(d, "price"),
        quantity: i64_from(d, "quantity"),
        color: opt_string(d, "color"),
    }
}

pub fn items_from(d: &Document, key: &str) -> Vec<CartItem> {
    d.get_array(key)
        .map(|arr| {
            arr.iter()
                .filter_map(|b| b.as_document())
                .map(doc_to_item)
                .collect()
        })
        .unwrap_or_default()
}

pub fn cart_to_doc(c: &CartDto) -> Document {
    let items: Vec<Bson> = c.items.iter().map(|i| Bson::Document(item_to_doc(i))).collect();
    doc! {
        "_id": &c.id,
        "id": &c.id,
        "user_id": &c.user_id,
        "items": items,
        "total_cart_price": Bson::from(c.total_cart_price),
        "total_after_discount": opt_f64_bson(c.total_after_discount),
        "coupon_code": opt_bson(c.coupon_code.clone()),
        "is_deleted": false,
        "created_at": &c.created_at,
    }
}

pub fn doc_to_cart(d: &Document) -> CartDto {
    CartDto {
        id: id_of(d),
        user_id: str_from(d, "user_id"),
        items: items_from(d, "items"),
        total_cart_price: f64_from(d, "total_cart_price"),
        total_after_discount: opt_f64(d, "total_after_discount"),
        coupon_code: opt_string(d, "coupon_code"),
        created_at: opt_string(d, "created_at").unwrap_or_else(now_iso_rfc3339),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart() -> CartDto {
        CartDto::new("c1".into(), "u1".into())
    }

    fn assert_invariant(c: &CartDto) {
        let expected: f64 = c.items.iter().map(|i| i.price * i.quantity as f64).sum();
        assert_eq!(c.total_cart_price, expected);
    }

    #[test]
    fn adding_items_maintains_total() {
        let mut c = cart();
        c.add_item("p1", "Shirt", 19.99, 2, None).unwrap();
        c.add_item("p2", "Hat", 5.5, 1, Some("red".into())).unwrap();
        assert_eq!(c.items.len(), 2);
        assert_eq!(round2(c.total_cart_price), 45.48);
        assert_invariant(&c);
    }

    #[test]
    fn same_product_and_color_merges_lines() {
        let mut c = cart();
        c.add_item("p1", "Shirt", 10.0, 1, Some("blue".into())).unwrap();
        c.add_item("p1", "Shirt", 10.0, 2, Some("blue".into())).unwrap();
        c.add_item("p1", "Shirt", 10.0, 1, Some("black".into())).unwrap();
        assert_eq!(c.items.len(), 2);
        assert_eq!(c.items[0].quantity, 3);
        assert_eq!(c.quantity_of("p1"), 4);
        assert_eq!(c.total_cart_price, 40.0);
    }

    #[test]
    fn set_quantity_and_remove_recompute() {
        let mut c = cart();
        c.add_item("p1", "Shirt", 10.0, 1, None).unwrap();
        c.add_item("p2", "Hat", 4.0, 1, None).unwrap();
        c.set_quantity("p2", None, 5).unwrap();
        assert_eq!(c.total_cart_price, 30.0);
        c.remove_item("p1", None).unwrap();
        assert_eq!(c.total_cart_price, 20.0);
        assert_invariant(&c);
        assert!(matches!(c.remove_item("p1", None), Err(ApiError::NotFound(_))));
        assert!(matches!(c.set_quantity("p2", None, 0), Err(ApiError::Validation(_))));
    }

    #[test]
    fn sub_cent_prices_keep_exact_total() {
        let mut c = cart();
        c.add_item("p1", "Bolt", 0.333, 3, None).unwrap();
        c.add_item("p2", "Nut", 0.1, 7, None).unwrap();
        assert_invariant(&c);
    }

    #[test]
    fn quantity_changes_target_the_color_line() {
        let mut c = cart();
        c.add_item("p1", "Shirt", 10.0, 1, Some("red".into())).unwrap();
        c.add_item("p1", "Shirt", 10.0, 2, Some("blue".into())).unwrap();

        assert!(matches!(c.set_quantity("p1", None, 4), Err(ApiError::Validation(_))));
        c.set_quantity("p1", Some("blue"), 5).unwrap();
        assert_eq!(c.items[0].quantity, 1);
        assert_eq!(c.items[1].quantity, 5);
        assert_eq!(c.quantity_elsewhere("p1", Some("blue")).unwrap(), 1);
        assert!(matches!(
            c.set_quantity("p1", Some("green"), 1),
            Err(ApiError::NotFound(_))
        ));

        c.remove_item("p1", Some("red")).unwrap();
        assert_eq!(c.items.len(), 1);
        assert_eq!(c.total_cart_price, 50.0);
        c.set_quantity("p1", None, 2).unwrap();
        assert_eq!(c.total_cart_price, 20.0);
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let mut c = cart();
        assert!(c.add_item("p1", "Shirt", 10.0, 0, None).is_err());
        assert!(c.items.is_empty());
    }

    #[test]
    fn item_changes_drop_applied_discount() {
        let mut c = cart();
        c.add_item("p1", "Shirt", 100.0, 1, None).unwrap();
        c.apply_discount("SAVE10", 10.0);
        assert_eq!(c.payable(), 90.0);
        c.add_item("p2", "Hat", 5.0, 1, None).unwrap();
        assert_eq!(c.coupon_code, None);
        assert_eq!(c.payable(), 105.0);
    }

    #[test]
    fn discount_never_goes_negative() {
        let mut c = cart();
        c.add_item("p1", "Pen", 3.0, 1, None).unwrap();
        c.apply_discount("BIG", 50.0);
        assert_eq!(c.total_after_discount, Some(0.0));
    }

    #[test]
    fn document_mapping_preserves_lines() {
        let mut c = cart();
        c.add_item("p1", "Shirt", 12.5, 2, Some("green".into())).unwrap();
        c.apply_discount("X", 5.0);
        let back = doc_to_cart(&cart_to_doc(&c));
        assert_eq!(back.items, c.items);
        assert_eq!(back.total_cart_price, 25.0);
        assert_eq!(back.total_after_discount, Some(20.0));
        assert_eq!(back.coupon_code.as_deref(), Some("X"));
    }
}
