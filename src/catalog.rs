use mongodb::{
    bson::{doc, Bson, Document},
    options::FindOptions,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::util::{
    escape_regex, f64_from, i64_from, id_of, now_iso_rfc3339, opt_bson, opt_f64, opt_f64_bson,
    opt_string, str_from, whole_cents,
};

pub const DEFAULT_PAGE_LIMIT: i64 = 20;
pub const MAX_PAGE_LIMIT: i64 = 100;

/* ================== Models ================== */

/// Brands and categories share one shape.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NamedDto {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub image_url: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SubcategoryDto {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub category_id: String,
    pub created_at: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProductDto {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub price: f64,
    pub price_after_discount: Option<f64>,
    pub stock: i64,
    pub sold: i64,
    pub category_id: String,
    pub subcategory_id: Option<String>,
    pub brand_id: Option<String>,
    pub image_url: Option<String>,
    pub colors: Vec<String>,
    pub version: i64,
    pub created_at: Option<String>,
}

impl ProductDto {
    /// Price a cart line is charged at.
    pub fn effective_price(&self) -> f64 {
        self.price_after_discount.unwrap_or(self.price)
    }
}

/* ================== Validation ================== */

pub fn validate_name(field: &str, value: &str) -> ApiResult<()> {
    let len = value.trim().chars().count();
    if !(2..=64).contains(&len) {
        return Err(ApiError::validation(format!(
            "{field} must be between 2 and 64 characters"
        )));
    }
    Ok(())
}

pub fn validate_pricing(price: f64, price_after_discount: Option<f64>) -> ApiResult<()> {
    if !price.is_finite() || price < 0.0 {
        return Err(ApiError::validation("price must be a non-negative number"));
    }
    if !whole_cents(price) {
        return Err(ApiError::validation("price cannot have more than 2 decimals"));
    }
    if let Some(p) = price_after_discount {
        if !p.is_finite() || p < 0.0 || p >= price {
            return Err(ApiError::validation(
                "price_after_discount must be lower than price",
            ));
        }
        if !whole_cents(p) {
            return Err(ApiError::validation(
                "price_after_discount cannot have more than 2 decimals",
            ));
        }
    }
    Ok(())
}

pub fn validate_stock(stock: i64) -> ApiResult<()> {
    if stock < 0 {
        return Err(ApiError::validation("stock cannot be negative"));
    }
    Ok(())
}

/* ================== Listing ================== */

#[derive(Deserialize, Default, Debug, Clone)]
pub struct ListQuery {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub keyword: Option<String>,
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub brand: Option<String>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub sort: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct Page<T> {
    pub results: usize,
    pub page: i64,
    pub limit: i64,
    pub total: u64,
    pub data: Vec<T>,
}

impl ListQuery {
    pub fn page(&self) -> i64 {
        self.page.filter(|p| *p >= 1).unwrap_or(1)
    }

    pub fn limit(&self) -> i64 {
        self.limit
            .map(|l| l.clamp(1, MAX_PAGE_LIMIT))
            .unwrap_or(DEFAULT_PAGE_LIMIT)
    }

    /// Filter for product listings. Soft-deleted products never match.
    pub fn product_filter(&self) -> Document {
        let mut f = doc! { "is_deleted": { "$ne": true } };
        if let Some(kw) = self.keyword.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let pattern = escape_regex(kw);
            f.insert(
                "$or",
                vec![
                    Bson::Document(doc! { "title": { "$regex": &pattern, "$options": "i" } }),
                    Bson::Document(doc! { "description": { "$regex": &pattern, "$options": "i" } }),
                ],
            );
        }
        if let Some(c) = &self.category {
            f.insert("category_id", c);
        }
        if let Some(s) = &self.subcategory {
            f.insert("subcategory_id", s);
        }
        if let Some(b) = &self.brand {
            f.insert("brand_id", b);
        }
        let mut price = Document::new();
        if let Some(min) = self.min_price {
            price.insert("$gte", min);
        }
        if let Some(max) = self.max_price {
            price.insert("$lte", max);
        }
        if !price.is_empty() {
            f.insert("price", price);
        }
        f
    }

    /// `sort=-price,title` style; unknown fields are ignored.
    pub fn sort_doc(&self, allowed: &[&str]) -> Document {
        let mut out = Document::new();
        if let Some(spec) = &self.sort {
            for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                let (field, dir) = match part.strip_prefix('-') {
                    Some(f) => (f, -1),
                    None => (part.strip_prefix('+').unwrap_or(part), 1),
                };
                if allowed.contains(&field) && !out.contains_key(field) {
                    out.insert(field, dir);
                }
            }
        }
        if out.is_empty() {
            out.insert("created_at", -1);
        }
        out.insert("_id", -1);
        out
    }

    pub fn find_options(&self, allowed_sort: &[&str]) -> FindOptions {
        FindOptions::builder()
            .sort(self.sort_doc(allowed_sort))
            .skip(((self.page() - 1) * self.limit()) as u64)
            .limit(self.limit())
            .build()
    }
}

pub const PRODUCT_SORT_FIELDS: &[&str] = &["price", "title", "sold", "created_at", "stock"];

/* ================== BSON mapping ================== */

pub fn doc_to_named(d: &Document) -> NamedDto {
    NamedDto {
        id: id_of(d),
        name: str_from(d, "name"),
        slug: str_from(d, "slug"),
        image_url: opt_string(d, "image_url"),
        created_at: opt_string(d, "created_at"),
    }
}

pub fn named_to_doc(n: &NamedDto) -> Document {
    doc! {
        "_id": &n.id,
        "id": &n.id,
        "name": &n.name,
        "slug": &n.slug,
        "image_url": opt_bson(n.image_url.clone()),
        "is_deleted": false,
        "created_at": n.created_at.clone().unwrap_or_else(now_iso_rfc3339),
    }
}

pub fn doc_to_subcategory(d: &Document) -> SubcategoryDto {
    SubcategoryDto {
        id: id_of(d),
        name: str_from(d, "name"),
        slug: str_from(d, "slug"),
        category_id: str_from(d, "category_id"),
        created_at: opt_string(d, "created_at"),
    }
}

pub fn subcategory_to_doc(s: &SubcategoryDto) -> Document {
    doc! {
        "_id": &s.id,
        "id": &s.id,
        "name": &s.name,
        "slug": &s.slug,
        "category_id": &s.category_id,
        "is_deleted": false,
        "created_at": s.created_at.clone().unwrap_or_else(now_iso_rfc3339),
    }
}

pub fn doc_to_product(d: &Document) -> ProductDto {
    ProductDto {
        id: id_of(d),
        title: str_from(d, "title"),
        slug: str_from(d, "slug"),
        description: str_from(d, "description"),
        price: f64_from(d, "price"),
        price_after_discount: opt_f64(d, "price_after_discount"),
        stock: i64_from(d, "stock"),
        sold: i64_from(d, "sold"),
        category_id: str_from(d, "category_id"),
        subcategory_id: opt_string(d, "subcategory_id"),
        brand_id: opt_string(d, "brand_id"),
        image_url: opt_string(d, "image_url"),
        colors: d
            .get_array("colors")
            .map(|a| {
                a.iter()
                    .filter_map(|c| c.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        version: i64_from(d, "version"),
        created_at: opt_string(d, "created_at"),
    }
}

pub fn product_to_doc(p: &ProductDto) -> Document {
    doc! {
        "_id": &p.id,
        "id": &p.id,
        "title": &p.title,
        "slug": &p.slug,
        "description": &p.description,
        "price": Bson::from(p.price),
        "price_after_discount": opt_f64_bson(p.price_after_discount),
        "stock": Bson::Int64(p.stock),
        "sold": Bson::Int64(p.sold),
        "category_id": &p.category_id,
        "subcategory_id": opt_bson(p.subcategory_id.clone()),
        "brand_id": opt_bson(p.brand_id.clone()),
        "image_url": opt_bson(p.image_url.clone()),
        "colors": p.colors.clone(),
        "version": Bson::Int64(p.version),
        "is_deleted": false,
        "created_at": p.created_at.clone().unwrap_or_else(now_iso_rfc3339),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_defaults_and_clamps() {
        let q = ListQuery::default();
        assert_eq!((q.page(), q.limit()), (1, DEFAULT_PAGE_LIMIT));

        let q = ListQuery {
            page: Some(0),
            limit: Some(1000),
            ..Default::default()
        };
        assert_eq!((q.page(), q.limit()), (1, MAX_PAGE_LIMIT));

        let q = ListQuery {
            page: Some(3),
            limit: Some(10),
            ..Default::default()
        };
        let opts = q.find_options(PRODUCT_SORT_FIELDS);
        assert_eq!(opts.skip, Some(20));
        assert_eq!(opts.limit, Some(10));
    }

    #[test]
    fn product_filter_combines_criteria() {
        let q = ListQuery {
            keyword: Some("usb (c)".into()),
            category: Some("cat-1".into()),
            min_price: Some(10.0),
            max_price: Some(99.5),
            ..Default::default()
        };
        let f = q.product_filter();
        assert_eq!(f.get_document("is_deleted").unwrap(), &doc! { "$ne": true });
        assert_eq!(f.get_str("category_id").unwrap(), "cat-1");
        assert_eq!(
            f.get_document("price").unwrap(),
            &doc! { "$gte": 10.0, "$lte": 99.5 }
        );
        let ors = f.get_array("$or").unwrap();
        let title = ors[0].as_document().unwrap().get_document("title").unwrap();
        assert_eq!(title.get_str("$regex").unwrap(), r"usb \(c\)");
    }

    #[test]
    fn blank_keyword_is_ignored() {
        let q = ListQuery {
            keyword: Some("   ".into()),
            ..Default::default()
        };
        assert!(!q.product_filter().contains_key("$or"));
    }

    #[test]
    fn sort_parsing_filters_unknown_fields() {
        let q = ListQuery {
            sort: Some("-price, title,password,-price".into()),
            ..Default::default()
        };
        assert_eq!(
            q.sort_doc(PRODUCT_SORT_FIELDS),
            doc! { "price": -1, "title": 1, "_id": -1 }
        );
        let q = ListQuery::default();
        assert_eq!(
            q.sort_doc(PRODUCT_SORT_FIELDS),
            doc! { "created_at": -1, "_id": -1 }
        );
    }

    #[test]
    fn pricing_rules() {
        assert!(validate_pricing(10.0, None).is_ok());
        assert!(validate_pricing(10.0, Some(8.0)).is_ok());
        assert!(validate_pricing(10.0, Some(10.0)).is_err());
        assert!(validate_pricing(-1.0, None).is_err());
        assert!(validate_pricing(f64::NAN, None).is_err());
        assert!(validate_pricing(19.99, Some(0.01)).is_ok());
        assert!(validate_pricing(0.333, None).is_err());
        assert!(validate_pricing(10.0, Some(4.999)).is_err());
        assert!(validate_stock(-1).is_err());
    }

    #[test]
    fn name_length_rules() {
        assert!(validate_name("name", "TV").is_ok());
        assert!(validate_name("name", " a ").is_err());
        assert!(validate_name("name", &"x".repeat(65)).is_err());
    }

    #[test]
    fn product_mapping_and_effective_price() {
        let p = ProductDto {
            id: "p1".into(),
            title: "Kettle".into(),
            slug: "kettle".into(),
            description: "Boils water".into(),
            price: 40.0,
            price_after_discount: Some(35.0),
            stock: 7,
            sold: 2,
            category_id: "c1".into(),
            subcategory_id: None,
            brand_id: Some("b1".into()),
            image_url: None,
            colors: vec!["white".into()],
            version: 3,
            created_at: None,
        };
        let back = doc_to_product(&product_to_doc(&p));
        assert_eq!(back.effective_price(), 35.0);
        assert_eq!(back.stock, 7);
        assert_eq!(back.colors, vec!["white".to_string()]);
        assert_eq!(back.brand_id.as_deref(), Some("b1"));
        assert_eq!(back.subcategory_id, None);
        assert_eq!(back.version, 3);
    }
}
