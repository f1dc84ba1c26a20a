use anyhow::{anyhow, Result};
use mongodb::{
    bson::{doc, Document},
    options::{FindOptions, IndexOptions},
    Client, Database, IndexModel,
};
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::util::{id_filter, now_iso_rfc3339};

static MONGO_DB: OnceCell<Database> = OnceCell::new();

pub const USERS: &str = "users";
pub const BRANDS: &str = "brands";
pub const CATEGORIES: &str = "categories";
pub const SUBCATEGORIES: &str = "subcategories";
pub const PRODUCTS: &str = "products";
pub const COUPONS: &str = "coupons";
pub const CARTS: &str = "carts";
pub const ORDERS: &str = "orders";

pub fn db() -> ApiResult<&'static Database> {
    MONGO_DB
        .get()
        .ok_or_else(|| ApiError::Internal("MongoDB not initialized".into()))
}

fn is_firestore_uri(uri: &str) -> bool {
    uri.contains(".firestore.goog")
}

/// Connects using `MONGO_URI` (required) and `MONGO_DB` (default `storefront`).
pub async fn init_mongo_from_env() -> Result<()> {
    let uri = std::env::var("MONGO_URI").map_err(|_| anyhow!("MONGO_URI missing in environment"))?;

    let client = Client::with_uri_str(&uri)
        .await
        .map_err(|e| anyhow!("Mongo connect error: {}", e))?;

    let dbname = std::env::var("MONGO_DB").unwrap_or_else(|_| "storefront".into());
    let database = client.database(&dbname);

    ensure_indexes(&database, is_firestore_uri(&uri)).await;

    MONGO_DB
        .set(database)
        .map_err(|_| anyhow!("MongoDB already initialized"))?;

    info!(target: "mongo", "connected to database {dbname}");
    Ok(())
}

pub fn sort_created_at_desc() -> FindOptions {
    FindOptions::builder()
        .sort(doc! { "created_at": -1, "_id": -1 })
        .build()
}

fn index(keys: Document, name: &str, unique: bool) -> IndexModel {
    IndexModel::builder()
        .keys(keys)
        .options(
            IndexOptions::builder()
                .unique(unique.then_some(true))
                .name(Some(name.to_string()))
                .build(),
        )
        .build()
}

/// Index creation failures are logged, not fatal; a duplicate in existing
/// data must not keep the API from starting.
async fn ensure_indexes(db: &Database, on_firestore: bool) {
    if on_firestore {
        return;
    }

    let wanted = [
        (USERS, index(doc! { "email": 1 }, "uniq_users_email", true)),
        (BRANDS, index(doc! { "slug": 1 }, "uniq_brands_slug", true)),
        (CATEGORIES, index(doc! { "slug": 1 }, "uniq_categories_slug", true)),
        (SUBCATEGORIES, index(doc! { "category_id": 1 }, "idx_subcategories_category", false)),
        (PRODUCTS, index(doc! { "slug": 1 }, "idx_products_slug", false)),
        (PRODUCTS, index(doc! { "category_id": 1, "price": 1 }, "idx_products_category_price", false)),
        (COUPONS, index(doc! { "code": 1 }, "uniq_coupons_code", true)),
        (CARTS, index(doc! { "user_id": 1, "is_deleted": 1 }, "idx_carts_user", false)),
        (ORDERS, index(doc! { "user_id": 1, "created_at": -1 }, "idx_orders_user", false)),
    ];

    for (coll, model) in wanted {
        if let Err(e) = db.collection::<Document>(coll).create_index(model, None).await {
            warn!(target: "mongo", "index on {coll} not created: {e}");
        }
    }
}

/// Duplicate-key writes surface as 409 instead of 500.
pub fn conflict_on_duplicate(e: mongodb::error::Error, what: &str) -> ApiError {
    use mongodb::error::{ErrorKind, WriteFailure};
    match e.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) if we.code == 11000 => {
            ApiError::conflict(format!("{what} already exists"))
        }
        _ => ApiError::Database(e),
    }
}

/// Marks a live record deleted; `false` when nothing matched.
pub async fn soft_delete(db: &Database, coll: &str, id: &str) -> ApiResult<bool> {
    let res = db
        .collection::<Document>(coll)
        .update_one(
            doc! { "$and": [ id_filter(id), { "is_deleted": { "$ne": true } } ] },
            doc! { "$set": { "is_deleted": true, "deleted_at": now_iso_rfc3339() } },
            None,
        )
        .await?;
    Ok(res.matched_count > 0)
}
