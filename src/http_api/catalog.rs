use axum::{
    extract::{Path, Query},
    http::StatusCode,
    Json,
};
use futures_util::TryStreamExt;
use mongodb::{
    bson::{doc, Bson, Document},
    Database,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use super::{ApiJson, AuthUser, OkMsg, OK};
use crate::catalog::{
    doc_to_named, doc_to_product, doc_to_subcategory, named_to_doc, product_to_doc,
    subcategory_to_doc, validate_name, validate_pricing, validate_stock, ListQuery, NamedDto,
    Page, ProductDto, SubcategoryDto, PRODUCT_SORT_FIELDS,
};
use crate::error::{ApiError, ApiResult};
use crate::mongo::{
    conflict_on_duplicate, db, soft_delete, sort_created_at_desc, BRANDS, CATEGORIES, PRODUCTS,
    SUBCATEGORIES,
};
use crate::util::{live_id_filter, now_iso_rfc3339, opt_bson, opt_f64_bson, slugify};

/* ================== Shared helpers ================== */

async fn find_live(db: &Database, coll: &str, id: &str) -> ApiResult<Option<Document>> {
    Ok(db
        .collection::<Document>(coll)
        .find_one(live_id_filter(id), None)
        .await?)
}

async fn require_live(db: &Database, coll: &str, id: &str, what: &'static str) -> ApiResult<Document> {
    find_live(db, coll, id).await?.ok_or(ApiError::NotFound(what))
}

async fn list_live(db: &Database, coll: &str, filter: Document) -> ApiResult<Vec<Document>> {
    let mut f = filter;
    f.insert("is_deleted", doc! { "$ne": true });
    let cur = db
        .collection::<Document>(coll)
        .find(f, sort_created_at_desc())
        .await?;
    Ok(cur.try_collect().await?)
}

/* ================== Brands & Categories ================== */

#[derive(Deserialize)]
pub struct NamedCreateReq {
    pub name: String,
    pub image_url: Option<String>,
}

#[derive(Deserialize)]
pub struct NamedUpdateReq {
    pub name: Option<String>,
    pub image_url: Option<String>,
}

async fn named_list(coll: &str) -> ApiResult<Json<Vec<NamedDto>>> {
    let docs = list_live(db()?, coll, Document::new()).await?;
    Ok(Json(docs.iter().map(doc_to_named).collect()))
}

async fn named_get(coll: &str, id: &str, what: &'static str) -> ApiResult<Json<NamedDto>> {
    let d = require_live(db()?, coll, id, what).await?;
    Ok(Json(doc_to_named(&d)))
}

async fn named_add(
    user: &AuthUser,
    coll: &str,
    what: &'static str,
    req: NamedCreateReq,
) -> ApiResult<(StatusCode, Json<NamedDto>)> {
    user.require_admin()?;
    validate_name("name", &req.name)?;

    let dto = NamedDto {
        id: Uuid::new_v4().to_string(),
        name: req.name.trim().to_string(),
        slug: slugify(&req.name),
        image_url: req.image_url,
        created_at: Some(now_iso_rfc3339()),
    };
    db()?
        .collection::<Document>(coll)
        .insert_one(named_to_doc(&dto), None)
        .await
        .map_err(|e| conflict_on_duplicate(e, what))?;
    info!(target: "catalog", "{what} created {} ({})", dto.name, dto.id);
    Ok((StatusCode::CREATED, Json(dto)))
}

async fn named_update(
    user: &AuthUser,
    coll: &str,
    what: &'static str,
    id: &str,
    req: NamedUpdateReq,
) -> ApiResult<Json<NamedDto>> {
    user.require_admin()?;
    let database = db()?;

    let mut set_doc = Document::new();
    if let Some(name) = req.name {
        validate_name("name", &name)?;
        set_doc.insert("slug", slugify(&name));
        set_doc.insert("name", name.trim());
    }
    if let Some(url) = req.image_url {
        set_doc.insert("image_url", url);
    }
    if !set_doc.is_empty() {
        let res = database
            .collection::<Document>(coll)
            .update_one(live_id_filter(id), doc! { "$set": set_doc }, None)
            .await
            .map_err(|e| conflict_on_duplicate(e, what))?;
        if res.matched_count == 0 {
            return Err(ApiError::NotFound(what));
        }
    }
    let d = require_live(database, coll, id, what).await?;
    Ok(Json(doc_to_named(&d)))
}

async fn named_delete(user: &AuthUser, coll: &str, what: &'static str, id: &str) -> ApiResult<Json<OkMsg>> {
    user.require_admin()?;
    if !soft_delete(db()?, coll, id).await? {
        return Err(ApiError::NotFound(what));
    }
    info!(target: "catalog", "{what} {id} soft-deleted");
    Ok(Json(OK))
}

pub async fn brands_list() -> ApiResult<Json<Vec<NamedDto>>> {
    named_list(BRANDS).await
}

pub async fn brand_get(Path(id): Path<String>) -> ApiResult<Json<NamedDto>> {
    named_get(BRANDS, &id, "Brand").await
}

pub async fn brand_add(
    user: AuthUser,
    ApiJson(req): ApiJson<NamedCreateReq>,
) -> ApiResult<(StatusCode, Json<NamedDto>)> {
    named_add(&user, BRANDS, "Brand", req).await
}

pub async fn brand_update(
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<NamedUpdateReq>,
) -> ApiResult<Json<NamedDto>> {
    named_update(&user, BRANDS, "Brand", &id, req).await
}

pub async fn brand_delete(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OkMsg>> {
    named_delete(&user, BRANDS, "Brand", &id).await
}

pub async fn categories_list() -> ApiResult<Json<Vec<NamedDto>>> {
    named_list(CATEGORIES).await
}

pub async fn category_get(Path(id): Path<String>) -> ApiResult<Json<NamedDto>> {
    named_get(CATEGORIES, &id, "Category").await
}

pub async fn category_add(
    user: AuthUser,
    ApiJson(req): ApiJson<NamedCreateReq>,
) -> ApiResult<(StatusCode, Json<NamedDto>)> {
    named_add(&user, CATEGORIES, "Category", req).await
}

pub async fn category_update(
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<NamedUpdateReq>,
) -> ApiResult<Json<NamedDto>> {
    named_update(&user, CATEGORIES, "Category", &id, req).await
}

pub async fn category_delete(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OkMsg>> {
    named_delete(&user, CATEGORIES, "Category", &id).await
}

/* ================== Subcategories ================== */

#[derive(Deserialize)]
pub struct SubcategoryCreateReq {
    pub name: String,
    pub category_id: String,
}

#[derive(Deserialize)]
pub struct SubcategoryUpdateReq {
    pub name: Option<String>,
    pub category_id: Option<String>,
}

pub async fn subcategories_list() -> ApiResult<Json<Vec<SubcategoryDto>>> {
    let docs = list_live(db()?, SUBCATEGORIES, Document::new()).await?;
    Ok(Json(docs.iter().map(doc_to_subcategory).collect()))
}

pub async fn subcategories_of_category(
    Path(category_id): Path<String>,
) -> ApiResult<Json<Vec<SubcategoryDto>>> {
    let database = db()?;
    require_live(database, CATEGORIES, &category_id, "Category").await?;
    let docs = list_live(database, SUBCATEGORIES, doc! { "category_id": &category_id }).await?;
    Ok(Json(docs.iter().map(doc_to_subcategory).collect()))
}

pub async fn subcategory_get(Path(id): Path<String>) -> ApiResult<Json<SubcategoryDto>> {
    let d = require_live(db()?, SUBCATEGORIES, &id, "Subcategory").await?;
    Ok(Json(doc_to_subcategory(&d)))
}

pub async fn subcategory_add(
    user: AuthUser,
    ApiJson(req): ApiJson<SubcategoryCreateReq>,
) -> ApiResult<(StatusCode, Json<SubcategoryDto>)> {
    user.require_admin()?;
    validate_name("name", &req.name)?;
    let database = db()?;
    require_live(database, CATEGORIES, &req.category_id, "Category").await?;

    let dto = SubcategoryDto {
        id: Uuid::new_v4().to_string(),
        name: req.name.trim().to_string(),
        slug: slugify(&req.name),
        category_id: req.category_id,
        created_at: Some(now_iso_rfc3339()),
    };
    database
        .collection::<Document>(SUBCATEGORIES)
        .insert_one(subcategory_to_doc(&dto), None)
        .await?;
    Ok((StatusCode::CREATED, Json(dto)))
}

pub async fn subcategory_update(
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<SubcategoryUpdateReq>,
) -> ApiResult<Json<SubcategoryDto>> {
    user.require_admin()?;
    let database = db()?;

    let mut set_doc = Document::new();
    if let Some(name) = req.name {
        validate_name("name", &name)?;
        set_doc.insert("slug", slugify(&name));
        set_doc.insert("name", name.trim());
    }
    if let Some(category_id) = req.category_id {
        require_live(database, CATEGORIES, &category_id, "Category").await?;
        set_doc.insert("category_id", category_id);
    }
    if !set_doc.is_empty() {
        let res = database
            .collection::<Document>(SUBCATEGORIES)
            .update_one(live_id_filter(&id), doc! { "$set": set_doc }, None)
            .await?;
        if res.matched_count == 0 {
            return Err(ApiError::NotFound("Subcategory"));
        }
    }
    let d = require_live(database, SUBCATEGORIES, &id, "Subcategory").await?;
    Ok(Json(doc_to_subcategory(&d)))
}

pub async fn subcategory_delete(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OkMsg>> {
    user.require_admin()?;
    if !soft_delete(db()?, SUBCATEGORIES, &id).await? {
        return Err(ApiError::NotFound("Subcategory"));
    }
    Ok(Json(OK))
}

/* ================== Products ================== */

#[derive(Deserialize)]
pub struct ProductCreateReq {
    pub title: String,
    pub description: String,
    pub price: f64,
    pub price_after_discount: Option<f64>,
    pub stock: i64,
    pub category_id: String,
    pub subcategory_id: Option<String>,
    pub brand_id: Option<String>,
    pub image_url: Option<String>,
    #[serde(default)]
    pub colors: Vec<String>,
}

#[derive(Deserialize)]
pub struct ProductUpdateReq {
    /// When present, the update only applies to this exact version.
    pub version: Option<i64>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<f64>,
    pub price_after_discount: Option<f64>,
    #[serde(default)]
    pub clear_discount: bool,
    pub stock: Option<i64>,
    pub category_id: Option<String>,
    pub subcategory_id: Option<String>,
    pub brand_id: Option<String>,
    pub image_url: Option<String>,
    pub colors: Option<Vec<String>>,
}

/// Category must exist; subcategory, when given, must belong to it.
async fn check_product_refs(
    database: &Database,
    category_id: &str,
    subcategory_id: Option<&str>,
    brand_id: Option<&str>,
) -> ApiResult<()> {
    require_live(database, CATEGORIES, category_id, "Category").await?;
    if let Some(sub_id) = subcategory_id {
        let sub = require_live(database, SUBCATEGORIES, sub_id, "Subcategory").await?;
        if sub.get_str("category_id").unwrap_or_default() != category_id {
            return Err(ApiError::validation(
                "Subcategory does not belong to the product category",
            ));
        }
    }
    if let Some(b) = brand_id {
        require_live(database, BRANDS, b, "Brand").await?;
    }
    Ok(())
}

pub async fn products_list(Query(q): Query<ListQuery>) -> ApiResult<Json<Page<ProductDto>>> {
    let coll = db()?.collection::<Document>(PRODUCTS);
    let filter = q.product_filter();
    let total = coll.count_documents(filter.clone(), None).await?;
    let docs: Vec<Document> = coll
        .find(filter, q.find_options(PRODUCT_SORT_FIELDS))
        .await?
        .try_collect()
        .await?;
    let data: Vec<ProductDto> = docs.iter().map(doc_to_product).collect();
    Ok(Json(Page {
        results: data.len(),
        page: q.page(),
        limit: q.limit(),
        total,
        data,
    }))
}

pub async fn product_get(Path(id): Path<String>) -> ApiResult<Json<ProductDto>> {
    let d = require_live(db()?, PRODUCTS, &id, "Product").await?;
    Ok(Json(doc_to_product(&d)))
}

pub async fn product_add(
    user: AuthUser,
    ApiJson(req): ApiJson<ProductCreateReq>,
) -> ApiResult<(StatusCode, Json<ProductDto>)> {
    user.require_admin()?;
    validate_name("title", &req.title)?;
    validate_pricing(req.price, req.price_after_discount)?;
    validate_stock(req.stock)?;
    if req.description.trim().len() < 10 {
        return Err(ApiError::validation("Description must be at least 10 characters"));
    }

    let database = db()?;
    check_product_refs(
        database,
        &req.category_id,
        req.subcategory_id.as_deref(),
        req.brand_id.as_deref(),
    )
    .await?;

    let dto = ProductDto {
        id: Uuid::new_v4().to_string(),
        slug: slugify(&req.title),
        title: req.title.trim().to_string(),
        description: req.description,
        price: req.price,
        price_after_discount: req.price_after_discount,
        stock: req.stock,
        sold: 0,
        category_id: req.category_id,
        subcategory_id: req.subcategory_id,
        brand_id: req.brand_id,
        image_url: req.image_url,
        colors: req.colors,
        version: 0,
        created_at: Some(now_iso_rfc3339()),
    };
    database
        .collection::<Document>(PRODUCTS)
        .insert_one(product_to_doc(&dto), None)
        .await?;
    info!(target: "catalog", "product created {} ({})", dto.title, dto.id);
    Ok((StatusCode::CREATED, Json(dto)))
}

pub async fn product_update(
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<ProductUpdateReq>,
) -> ApiResult<Json<ProductDto>> {
    user.require_admin()?;
    let database = db()?;
    let current = doc_to_product(&require_live(database, PRODUCTS, &id, "Product").await?);

    if let Some(v) = req.version {
        if v != current.version {
            return Err(ApiError::conflict(format!(
                "Product was modified (version {} != {v})",
                current.version
            )));
        }
    }

    let price = req.price.unwrap_or(current.price);
    let discounted = if req.clear_discount {
        None
    } else {
        req.price_after_discount.or(current.price_after_discount)
    };
    validate_pricing(price, discounted)?;

    let category_id = req.category_id.clone().unwrap_or(current.category_id.clone());
    let subcategory_id = req.subcategory_id.clone().or(current.subcategory_id.clone());
    let brand_id = req.brand_id.clone().or(current.brand_id.clone());
    if req.category_id.is_some() || req.subcategory_id.is_some() || req.brand_id.is_some() {
        check_product_refs(
            database,
            &category_id,
            subcategory_id.as_deref(),
            brand_id.as_deref(),
        )
        .await?;
    }

    let mut set_doc = doc! {
        "price": Bson::from(price),
        "price_after_discount": opt_f64_bson(discounted),
        "category_id": &category_id,
        "subcategory_id": opt_bson(subcategory_id),
        "brand_id": opt_bson(brand_id),
        "updated_at": now_iso_rfc3339(),
    };
    if let Some(title) = req.title {
        validate_name("title", &title)?;
        set_doc.insert("slug", slugify(&title));
        set_doc.insert("title", title.trim());
    }
    if let Some(description) = req.description {
        set_doc.insert("description", description);
    }
    if let Some(stock) = req.stock {
        validate_stock(stock)?;
        set_doc.insert("stock", Bson::Int64(stock));
    }
    if let Some(url) = req.image_url {
        set_doc.insert("image_url", url);
    }
    if let Some(colors) = req.colors {
        set_doc.insert("colors", colors);
    }

    // The version read above guards the write.
    let res = database
        .collection::<Document>(PRODUCTS)
        .update_one(
            doc! { "_id": &current.id, "version": Bson::Int64(current.version), "is_deleted": { "$ne": true } },
            doc! { "$set": set_doc, "$inc": { "version": Bson::Int64(1) } },
            None,
        )
        .await?;
    if res.matched_count == 0 {
        return Err(ApiError::conflict("Product was modified concurrently, retry"));
    }

    let d = require_live(database, PRODUCTS, &id, "Product").await?;
    Ok(Json(doc_to_product(&d)))
}

pub async fn product_delete(user: AuthUser, Path(id): Path<String>) -> ApiResult<Json<OkMsg>> {
    user.require_admin()?;
    if !soft_delete(db()?, PRODUCTS, &id).await? {
        return Err(ApiError::NotFound("Product"));
    }
    info!(target: "catalog", "product {id} soft-deleted");
    Ok(Json(OK))
}
