use std::{net::SocketAddr, sync::Arc};

use axum::{
    async_trait,
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, FromRequestParts, State},
    http::{header::AUTHORIZATION, request::Parts, Method, Request},
    middleware::{from_fn_with_state, Next},
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use mongodb::bson::Document;
use serde::{de::DeserializeOwned, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::auth::{verify_authorization, Role};
use crate::config::AppConfig;
use crate::error::{ApiError, ApiResult};
use crate::mongo::{db, USERS};
use crate::util::{bool_from, i64_from, live_id_filter, now_iso_rfc3339, str_from};

mod account;
mod cart;
mod catalog;
mod coupons;
mod orders;
mod webhooks;

/* ================== Context ================== */

pub struct ApiCtx {
    pub config: AppConfig,
    pub http: reqwest::Client,
}

impl ApiCtx {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }
}

pub type SharedCtx = Arc<ApiCtx>;

#[derive(Serialize)]
pub struct OkMsg {
    pub ok: bool,
}

const OK: OkMsg = OkMsg { ok: true };

/// `Json` body extractor whose rejections use the API error shape (400).
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request<Body>, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e: JsonRejection| ApiError::validation(e.body_text()))?;
        Ok(ApiJson(value))
    }
}

/* ================== Caller identity ================== */

/// The authenticated caller, placed in request extensions by `auth_mw`.
#[derive(Clone, Debug)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub role: Role,
}

impl AuthUser {
    pub fn require_admin(&self) -> ApiResult<()> {
        match self.role {
            Role::Admin => Ok(()),
            Role::User => Err(ApiError::Forbidden("Admin access required".into())),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .cloned()
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".into()))
    }
}

/* ================== Auth Middleware ================== */

/// Verifies the `Authorization` header when present and resolves the user.
/// Anonymous requests pass through; handlers that need a caller take `AuthUser`.
async fn auth_mw(
    State(ctx): State<SharedCtx>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    info!(target: "http", "HTTP {} {}", req.method(), req.uri().path());

    if req.method() == Method::OPTIONS {
        return Ok(next.run(req).await);
    }

    let Some(header) = req
        .headers()
        .get(AUTHORIZATION)
        .map(|v| v.to_str().map(str::to_string))
    else {
        return Ok(next.run(req).await);
    };
    let header =
        header.map_err(|_| ApiError::Unauthorized("Malformed Authorization header".into()))?;

    let claims = verify_authorization(&header, &ctx.config.jwt).map_err(|e| {
        warn!(target: "http", "-> rejected token: {e}");
        e
    })?;

    let user = db()?
        .collection::<Document>(USERS)
        .find_one(live_id_filter(&claims.sub), None)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("User no longer exists".into()))?;

    let stored_role = user.get_str("role").ok().and_then(Role::parse).unwrap_or(Role::User);
    if stored_role != claims.role {
        return Err(ApiError::Unauthorized("Role changed, sign in again".into()));
    }
    if !bool_from(&user, "is_active").unwrap_or(true) {
        return Err(ApiError::Forbidden("Account is disabled".into()));
    }
    if claims.iat < i64_from(&user, "password_changed_at") {
        return Err(ApiError::Unauthorized(
            "Password changed, sign in again".into(),
        ));
    }

    req.extensions_mut().insert(AuthUser {
        id: claims.sub,
        email: claims.email,
        name: str_from(&user, "name"),
        role: stored_role,
    });
    Ok(next.run(req).await)
}

/* ================== Health ================== */

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "ok": true,
        "service": "storefront-api",
        "ts": now_iso_rfc3339()
    }))
}

/* ================== Router ================== */

pub fn build_router(ctx: SharedCtx) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health))
        // account
        .route("/api/auth/signup", post(account::signup))
        .route("/api/auth/login", post(account::login))
        .route("/api/auth/confirm/:token", get(account::confirm_email))
        .route("/api/auth/forgot-password", post(account::forgot_password))
        .route("/api/auth/reset-password", post(account::reset_password))
        .route("/api/auth/me", get(account::me))
        .route("/api/users", get(account::users_list))
        .route("/api/users/:id/role", put(account::user_set_role))
        // catalog
        .route("/api/brands", get(catalog::brands_list).post(catalog::brand_add))
        .route(
            "/api/brands/:id",
            get(catalog::brand_get)
                .put(catalog::brand_update)
                .delete(catalog::brand_delete),
        )
        .route(
            "/api/categories",
            get(catalog::categories_list).post(catalog::category_add),
        )
        .route(
            "/api/categories/:id",
            get(catalog::category_get)
                .put(catalog::category_update)
                .delete(catalog::category_delete),
        )
        .route(
            "/api/categories/:id/subcategories",
            get(catalog::subcategories_of_category),
        )
        .route(
            "/api/subcategories",
            get(catalog::subcategories_list).post(catalog::subcategory_add),
        )
        .route(
            "/api/subcategories/:id",
            get(catalog::subcategory_get)
                .put(catalog::subcategory_update)
                .delete(catalog::subcategory_delete),
        )
        .route(
            "/api/products",
            get(catalog::products_list).post(catalog::product_add),
        )
        .route(
            "/api/products/:id",
            get(catalog::product_get)
                .put(catalog::product_update)
                .delete(catalog::product_delete),
        )
        // coupons
        .route("/api/coupons", get(coupons::coupons_list).post(coupons::coupon_add))
        .route("/api/coupons/validate", post(coupons::coupon_validate))
        .route(
            "/api/coupons/:id",
            get(coupons::coupon_get)
                .put(coupons::coupon_update)
                .delete(coupons::coupon_delete),
        )
        // cart
        .route(
            "/api/cart",
            get(cart::cart_get).post(cart::cart_add).delete(cart::cart_clear),
        )
        .route("/api/cart/apply-coupon", post(cart::cart_apply_coupon))
        .route(
            "/api/cart/:product_id",
            put(cart::cart_set_quantity).delete(cart::cart_remove),
        )
        // orders
        .route("/api/orders", get(orders::orders_list).post(orders::order_checkout))
        .route("/api/orders/:id", get(orders::order_get))
        .route("/api/orders/:id/pay", put(orders::order_mark_paid))
        .route("/api/orders/:id/deliver", put(orders::order_mark_delivered))
        .route("/api/orders/:id/cancel", put(orders::order_cancel))
        // payment provider callbacks
        .route(
            "/api/webhooks/paymob",
            post(webhooks::paymob_processed).get(webhooks::paymob_redirect),
        )
        .route("/api/webhooks/stripe", post(webhooks::stripe_event))
        .layer(from_fn_with_state(ctx.clone(), auth_mw))
        .with_state(ctx)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/* ================== Runner ================== */

pub async fn run_http_server(config: AppConfig) -> anyhow::Result<()> {
    let port = config.port;
    let ctx = Arc::new(ApiCtx::new(config));

    if ctx.config.paymob.is_none() {
        warn!(target: "payments", "Paymob not configured, card checkout disabled");
    }
    if ctx.config.stripe.is_none() {
        warn!(target: "payments", "Stripe not configured, stripe checkout disabled");
    }

    if let Some(seed) = &ctx.config.admin_seed {
        account::ensure_admin(seed).await?;
    }

    let app = build_router(ctx);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(target: "http", "[http] listening on http://{addr}");

    axum::serve(listener, app).await?;
    Ok(())
}
