use axum::async_trait;
use mongodb::{
    bson::{doc, Bson, Document},
    Database,
};

use crate::coupon::redeem_filter;
use crate::error::ApiResult;
use crate::mongo::{db, CARTS, COUPONS, ORDERS, PRODUCTS};
use crate::order::{order_to_doc, transition_fields, OrderDto, OrderStatus};
use crate::util::now_iso_rfc3339;

/// Conditional writes that checkout and order transitions are built from.
/// Every method changes at most one record and reports whether its guard held.
#[async_trait]
pub trait Store: Send + Sync {
    /// Takes `qty` units; `false` when fewer remain or the product is gone.
    async fn take_stock(&self, product_id: &str, qty: i64) -> ApiResult<bool>;
    async fn return_stock(&self, product_id: &str, qty: i64) -> ApiResult<()>;

    /// Counts one use of a coupon that is still usable at `now_rfc3339`.
    async fn take_coupon_use(&self, code: &str, now_rfc3339: &str) -> ApiResult<bool>;
    async fn return_coupon_use(&self, code: &str) -> ApiResult<()>;

    /// Marks an open cart checked out; `false` when someone else already did.
    async fn claim_cart(&self, cart_id: &str) -> ApiResult<bool>;
    /// Reopens a claimed cart unless the user has started a new one.
    async fn reopen_cart(&self, cart_id: &str, user_id: &str) -> ApiResult<bool>;

    async fn insert_order(&self, order: &OrderDto) -> ApiResult<()>;
    async fn set_payment_ref(&self, order_id: &str, payment_ref: &str) -> ApiResult<()>;
    /// Applies `from -> to` only while the stored status is still `from`.
    async fn transition_order(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        payment_ref: Option<&str>,
    ) -> ApiResult<bool>;
}

pub struct MongoStore {
    db: &'static Database,
}

impl MongoStore {
    pub fn connect() -> ApiResult<Self> {
        Ok(Self { db: db()? })
    }

    fn coll(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

#[async_trait]
impl Store for MongoStore {
    async fn take_stock(&self, product_id: &str, qty: i64) -> ApiResult<bool> {
        let res = self
            .coll(PRODUCTS)
            .update_one(
                doc! { "_id": product_id, "is_deleted": { "$ne": true }, "stock": { "$gte": qty } },
                doc! { "$inc": { "stock": -qty, "sold": qty } },
                None,
            )
            .await?;
        Ok(res.modified_count == 1)
    }

    async fn return_stock(&self, product_id: &str, qty: i64) -> ApiResult<()> {
        self.coll(PRODUCTS)
            .update_one(
                doc! { "_id": product_id },
                doc! { "$inc": { "stock": qty, "sold": -qty } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn take_coupon_use(&self, code: &str, now_rfc3339: &str) -> ApiResult<bool> {
        let res = self
            .coll(COUPONS)
            .update_one(
                redeem_filter(code, now_rfc3339),
                doc! { "$inc": { "used_count": Bson::Int64(1) } },
                None,
            )
            .await?;
        Ok(res.modified_count == 1)
    }

    async fn return_coupon_use(&self, code: &str) -> ApiResult<()> {
        self.coll(COUPONS)
            .update_one(
                doc! { "code": code, "used_count": { "$gt": 0 } },
                doc! { "$inc": { "used_count": Bson::Int64(-1) } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn claim_cart(&self, cart_id: &str) -> ApiResult<bool> {
        let res = self
            .coll(CARTS)
            .update_one(
                doc! { "_id": cart_id, "is_deleted": { "$ne": true } },
                doc! { "$set": { "is_deleted": true, "deleted_at": now_iso_rfc3339() } },
                None,
            )
            .await?;
        Ok(res.modified_count == 1)
    }

    async fn reopen_cart(&self, cart_id: &str, user_id: &str) -> ApiResult<bool> {
        let open = self
            .coll(CARTS)
            .count_documents(doc! { "user_id": user_id, "is_deleted": { "$ne": true } }, None)
            .await?;
        if open > 0 {
            return Ok(false);
        }
        let res = self
            .coll(CARTS)
            .update_one(
                doc! { "_id": cart_id, "is_deleted": true },
                doc! { "$set": { "is_deleted": false }, "$unset": { "deleted_at": "" } },
                None,
            )
            .await?;
        Ok(res.modified_count == 1)
    }

    async fn insert_order(&self, order: &OrderDto) -> ApiResult<()> {
        self.coll(ORDERS).insert_one(order_to_doc(order), None).await?;
        Ok(())
    }

    async fn set_payment_ref(&self, order_id: &str, payment_ref: &str) -> ApiResult<()> {
        self.coll(ORDERS)
            .update_one(
                doc! { "_id": order_id },
                doc! { "$set": { "payment_ref": payment_ref } },
                None,
            )
            .await?;
        Ok(())
    }

    async fn transition_order(
        &self,
        order_id: &str,
        from: OrderStatus,
        to: OrderStatus,
        payment_ref: Option<&str>,
    ) -> ApiResult<bool> {
        let res = self
            .coll(ORDERS)
            .update_one(
                doc! { "_id": order_id, "status": from.as_str() },
                doc! { "$set": transition_fields(from, to, &now_iso_rfc3339(), payment_ref) },
                None,
            )
            .await?;
        Ok(res.modified_count == 1)
    }
}

/// In-process store with the same guards, for exercising checkout flows.
#[cfg(test)]
pub mod memory {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;
    use crate::order::doc_to_order;

    #[derive(Default)]
    struct State {
        stock: HashMap<String, i64>,
        /// code -> (used, max)
        coupons: HashMap<String, (i64, Option<i64>)>,
        /// cart id -> (user id, deleted)
        carts: HashMap<String, (String, bool)>,
        orders: HashMap<String, Document>,
        fail_order_insert: bool,
    }

    #[derive(Default)]
    pub struct MemoryStore {
        state: Mutex<State>,
    }

    impl MemoryStore {
        pub fn with_stock(self, product_id: &str, qty: i64) -> Self {
            self.state.lock().unwrap().stock.insert(product_id.into(), qty);
            self
        }

        pub fn with_coupon(self, code: &str, used: i64, max: Option<i64>) -> Self {
            self.state.lock().unwrap().coupons.insert(code.into(), (used, max));
            self
        }

        pub fn with_cart(self, cart_id: &str, user_id: &str) -> Self {
            self.state
                .lock()
                .unwrap()
                .carts
                .insert(cart_id.into(), (user_id.into(), false));
            self
        }

        pub fn failing_order_insert(self) -> Self {
            self.state.lock().unwrap().fail_order_insert = true;
            self
        }

        pub fn stock(&self, product_id: &str) -> i64 {
            self.state.lock().unwrap().stock.get(product_id).copied().unwrap_or(0)
        }

        pub fn coupon_uses(&self, code: &str) -> i64 {
            self.state.lock().unwrap().coupons.get(code).map(|c| c.0).unwrap_or(0)
        }

        pub fn cart_open(&self, cart_id: &str) -> bool {
            self.state
                .lock()
                .unwrap()
                .carts
                .get(cart_id)
                .map(|c| !c.1)
                .unwrap_or(false)
        }

        pub fn order(&self, order_id: &str) -> Option<OrderDto> {
            self.state.lock().unwrap().orders.get(order_id).map(doc_to_order)
        }

        pub fn order_count(&self) -> usize {
            self.state.lock().unwrap().orders.len()
        }
    }

    #[async_trait]
    impl Store for MemoryStore {
        async fn take_stock(&self, product_id: &str, qty: i64) -> ApiResult<bool> {
            let mut st = self.state.lock().unwrap();
            match st.stock.get_mut(product_id) {
                Some(left) if *left >= qty => {
                    *left -= qty;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn return_stock(&self, product_id: &str, qty: i64) -> ApiResult<()> {
            *self.state.lock().unwrap().stock.entry(product_id.into()).or_default() += qty;
            Ok(())
        }

        async fn take_coupon_use(&self, code: &str, _now: &str) -> ApiResult<bool> {
            let mut st = self.state.lock().unwrap();
            match st.coupons.get_mut(code) {
                Some((used, max)) if max.map_or(true, |m| *used < m) => {
                    *used += 1;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn return_coupon_use(&self, code: &str) -> ApiResult<()> {
            if let Some((used, _)) = self.state.lock().unwrap().coupons.get_mut(code) {
                if *used > 0 {
                    *used -= 1;
                }
            }
            Ok(())
        }

        async fn claim_cart(&self, cart_id: &str) -> ApiResult<bool> {
            match self.state.lock().unwrap().carts.get_mut(cart_id) {
                Some((_, deleted)) if !*deleted => {
                    *deleted = true;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn reopen_cart(&self, cart_id: &str, user_id: &str) -> ApiResult<bool> {
            let mut st = self.state.lock().unwrap();
            if st.carts.values().any(|(u, deleted)| u == user_id && !*deleted) {
                return Ok(false);
            }
            match st.carts.get_mut(cart_id) {
                Some((_, deleted)) if *deleted => {
                    *deleted = false;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn insert_order(&self, order: &OrderDto) -> ApiResult<()> {
            let mut st = self.state.lock().unwrap();
            if st.fail_order_insert {
                return Err(crate::error::ApiError::Internal("order insert failed".into()));
            }
            st.orders.insert(order.id.clone(), order_to_doc(order));
            Ok(())
        }

        async fn set_payment_ref(&self, order_id: &str, payment_ref: &str) -> ApiResult<()> {
            if let Some(d) = self.state.lock().unwrap().orders.get_mut(order_id) {
                d.insert("payment_ref", payment_ref);
            }
            Ok(())
        }

        async fn transition_order(
            &self,
            order_id: &str,
            from: OrderStatus,
            to: OrderStatus,
            payment_ref: Option<&str>,
        ) -> ApiResult<bool> {
            let mut st = self.state.lock().unwrap();
            let Some(d) = st.orders.get_mut(order_id) else {
                return Ok(false);
            };
            if d.get_str("status").ok() != Some(from.as_str()) {
                return Ok(false);
            }
            for (k, v) in transition_fields(from, to, &now_iso_rfc3339(), payment_ref) {
                d.insert(k, v);
            }
            Ok(true)
        }
    }
}
