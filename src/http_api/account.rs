use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use futures_util::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::{ApiJson, AuthUser, OkMsg, SharedCtx, OK};
use crate::auth::{
    hash_password, hash_reset_code, issue_email_token, issue_token, looks_like_email,
    normalize_email, reset_code, verify_email_token, verify_password, Role, RESET_CODE_TTL_SECS,
};
use crate::config::AdminSeed;
use crate::error::{ApiError, ApiResult};
use crate::mongo::{conflict_on_duplicate, db, sort_created_at_desc, USERS};
use crate::util::{bool_from, i64_from, id_of, now_iso_rfc3339, opt_string, str_from};

const MIN_PASSWORD_LEN: usize = 8;

#[derive(Serialize, Clone)]
pub struct UserDto {
    pub id: String,
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
    pub role: Role,
    pub confirm_email: bool,
    pub created_at: Option<String>,
}

fn doc_to_user(d: &Document) -> UserDto {
    UserDto {
        id: id_of(d),
        name: str_from(d, "name"),
        email: str_from(d, "email"),
        phone: opt_string(d, "phone"),
        role: d.get_str("role").ok().and_then(Role::parse).unwrap_or(Role::User),
        confirm_email: bool_from(d, "confirm_email").unwrap_or(false),
        created_at: opt_string(d, "created_at"),
    }
}

fn check_password(password: &str) -> ApiResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/* ---- signup ---- */

#[derive(Deserialize)]
pub struct SignupReq {
    pub name: String,
    pub email: String,
    pub password: String,
    pub phone: Option<String>,
}

pub async fn signup(
    State(ctx): State<SharedCtx>,
    ApiJson(req): ApiJson<SignupReq>,
) -> ApiResult<(StatusCode, Json<UserDto>)> {
    let name = req.name.trim().to_string();
    if name.is_empty() {
        return Err(ApiError::validation("Name is required"));
    }
    let email = normalize_email(&req.email);
    if !looks_like_email(&email) {
        return Err(ApiError::validation("Email is invalid"));
    }
    check_password(&req.password)?;

    let users = db()?.collection::<Document>(USERS);
    let id = Uuid::new_v4().to_string();
    let created_at = now_iso_rfc3339();
    let docu = doc! {
        "_id": &id,
        "id": &id,
        "name": &name,
        "email": &email,
        "phone": req.phone.clone().map(Bson::String).unwrap_or(Bson::Null),
        "password": hash_password(&req.password)?,
        "role": Role::User.as_str(),
        "confirm_email": false,
        "is_active": true,
        "is_deleted": false,
        "password_changed_at": Bson::Int64(0),
        "created_at": &created_at,
    };
    users
        .insert_one(docu, None)
        .await
        .map_err(|e| conflict_on_duplicate(e, "Email"))?;

    // Delivery is handled outside this service; the link is logged for it.
    let token = issue_email_token(&id, &email, &ctx.config.jwt)?;
    info!(
        target: "auth",
        "signup {email}: confirm at {}/api/auth/confirm/{token}",
        ctx.config.public_base_url
    );

    Ok((
        StatusCode::CREATED,
        Json(UserDto {
            id,
            name,
            email,
            phone: req.phone,
            role: Role::User,
            confirm_email: false,
            created_at: Some(created_at),
        }),
    ))
}

pub async fn confirm_email(
    State(ctx): State<SharedCtx>,
    Path(token): Path<String>,
) -> ApiResult<Json<OkMsg>> {
    let claims = verify_email_token(&token, &ctx.config.jwt)?;
    let res = db()?
        .collection::<Document>(USERS)
        .update_one(
            doc! { "_id": &claims.sub, "email": &claims.email, "is_deleted": { "$ne": true } },
            doc! { "$set": { "confirm_email": true } },
            None,
        )
        .await?;
    if res.matched_count == 0 {
        return Err(ApiError::NotFound("User"));
    }
    info!(target: "auth", "email confirmed for {}", claims.email);
    Ok(Json(OK))
}

/* ---- login ---- */

#[derive(Deserialize)]
pub struct LoginReq {
    email: String,
    password: String,
}

#[derive(Serialize)]
pub struct LoginResp {
    ok: bool,
    token: String,
    /// Scheme to send the token under in `Authorization`.
    scheme: &'static str,
    user: UserDto,
}

pub async fn login(
    State(ctx): State<SharedCtx>,
    ApiJson(req): ApiJson<LoginReq>,
) -> ApiResult<Json<LoginResp>> {
    let invalid = || ApiError::Unauthorized("Invalid credentials".into());
    let email = normalize_email(&req.email);

    let user = db()?
        .collection::<Document>(USERS)
        .find_one(doc! { "email": &email, "is_deleted": { "$ne": true } }, None)
        .await?
        .ok_or_else(invalid)?;

    if !verify_password(&req.password, user.get_str("password").unwrap_or("")) {
        return Err(invalid());
    }

    let dto = doc_to_user(&user);
    if !dto.confirm_email {
        return Err(ApiError::Forbidden("Confirm your email before signing in".into()));
    }
    if !bool_from(&user, "is_active").unwrap_or(true) {
        return Err(ApiError::Forbidden("Account is disabled".into()));
    }

    let token = issue_token(
        &dto.id,
        &dto.email,
        dto.role,
        &ctx.config.jwt,
        ctx.config.jwt_ttl_secs,
    )?;
    Ok(Json(LoginResp {
        ok: true,
        token,
        scheme: dto.role.scheme(),
        user: dto,
    }))
}

pub async fn me(user: AuthUser) -> ApiResult<Json<UserDto>> {
    let docu = db()?
        .collection::<Document>(USERS)
        .find_one(doc! { "_id": &user.id }, None)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    Ok(Json(doc_to_user(&docu)))
}

/* ---- password reset ---- */

#[derive(Deserialize)]
pub struct ForgotReq {
    email: String,
}

/// Always answers ok so the endpoint does not reveal which emails have accounts.
pub async fn forgot_password(ApiJson(req): ApiJson<ForgotReq>) -> ApiResult<Json<OkMsg>> {
    let email = normalize_email(&req.email);
    let code = reset_code();
    let expires = OffsetDateTime::now_utc().unix_timestamp() + RESET_CODE_TTL_SECS;

    let res = db()?
        .collection::<Document>(USERS)
        .update_one(
            doc! { "email": &email, "is_deleted": { "$ne": true } },
            doc! { "$set": {
                "reset_code_hash": hash_reset_code(&code),
                "reset_code_expires": Bson::Int64(expires),
            }},
            None,
        )
        .await?;
    if res.matched_count > 0 {
        info!(target: "auth", "password reset code for {email}: {code}");
    }
    Ok(Json(OK))
}

#[derive(Deserialize)]
pub struct ResetReq {
    email: String,
    code: String,
    password: String,
}

pub async fn reset_password(ApiJson(req): ApiJson<ResetReq>) -> ApiResult<Json<OkMsg>> {
    check_password(&req.password)?;
    let email = normalize_email(&req.email);
    let users = db()?.collection::<Document>(USERS);
    let bad_code = || ApiError::validation("Reset code is invalid or expired");

    let user = users
        .find_one(doc! { "email": &email, "is_deleted": { "$ne": true } }, None)
        .await?
        .ok_or_else(bad_code)?;

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let stored = user.get_str("reset_code_hash").unwrap_or("");
    if stored.is_empty()
        || stored != hash_reset_code(&req.code)
        || i64_from(&user, "reset_code_expires") < now
    {
        return Err(bad_code());
    }

    users
        .update_one(
            doc! { "_id": id_of(&user) },
            doc! {
                "$set": {
                    "password": hash_password(&req.password)?,
                    "password_changed_at": Bson::Int64(now),
                },
                "$unset": { "reset_code_hash": "", "reset_code_expires": "" },
            },
            None,
        )
        .await?;
    info!(target: "auth", "password reset for {email}");
    Ok(Json(OK))
}

/* ---- admin bootstrap & roles ---- */

/// Makes sure the configured admin account exists. An existing user with
/// that email is promoted and keeps its password.
pub async fn ensure_admin(seed: &AdminSeed) -> ApiResult<()> {
    let users = db()?.collection::<Document>(USERS);
    let email = normalize_email(&seed.email);

    let promoted = users
        .update_one(
            doc! { "email": &email, "is_deleted": { "$ne": true } },
            doc! { "$set": { "role": Role::Admin.as_str(), "confirm_email": true } },
            None,
        )
        .await?;
    if promoted.matched_count > 0 {
        if promoted.modified_count > 0 {
            info!(target: "auth", "existing user {email} promoted to admin");
        }
        return Ok(());
    }

    check_password(&seed.password)?;
    let id = Uuid::new_v4().to_string();
    let docu = doc! {
        "_id": &id,
        "id": &id,
        "name": &seed.name,
        "email": &email,
        "phone": Bson::Null,
        "password": hash_password(&seed.password)?,
        "role": Role::Admin.as_str(),
        "confirm_email": true,
        "is_active": true,
        "is_deleted": false,
        "password_changed_at": Bson::Int64(0),
        "created_at": now_iso_rfc3339(),
    };
    users
        .insert_one(docu, None)
        .await
        .map_err(|e| conflict_on_duplicate(e, "Email"))?;
    info!(target: "auth", "admin account {email} created");
    Ok(())
}

pub async fn users_list(user: AuthUser) -> ApiResult<Json<Vec<UserDto>>> {
    user.require_admin()?;
    let docs: Vec<Document> = db()?
        .collection::<Document>(USERS)
        .find(doc! { "is_deleted": { "$ne": true } }, sort_created_at_desc())
        .await?
        .try_collect()
        .await?;
    Ok(Json(docs.iter().map(doc_to_user).collect()))
}

#[derive(Deserialize)]
pub struct RoleReq {
    role: String,
}

/// Admins cannot demote themselves, so the last admin cannot lock everyone out.
fn check_role_change(actor: &AuthUser, target_id: &str, role: Role) -> ApiResult<()> {
    if actor.id == target_id && role != Role::Admin {
        return Err(ApiError::validation("Admins cannot remove their own admin role"));
    }
    Ok(())
}

/// Tokens issued under the old role stop working because `auth_mw`
/// compares the token role with the stored one.
pub async fn user_set_role(
    user: AuthUser,
    Path(id): Path<String>,
    ApiJson(req): ApiJson<RoleReq>,
) -> ApiResult<Json<UserDto>> {
    user.require_admin()?;
    let role = Role::parse(&req.role)
        .ok_or_else(|| ApiError::validation(format!("Unknown role {}", req.role)))?;
    check_role_change(&user, &id, role)?;

    let users = db()?.collection::<Document>(USERS);
    let res = users
        .update_one(
            doc! { "_id": &id, "is_deleted": { "$ne": true } },
            doc! { "$set": { "role": role.as_str() } },
            None,
        )
        .await?;
    if res.matched_count == 0 {
        return Err(ApiError::NotFound("User"));
    }
    if res.modified_count > 0 {
        warn!(target: "auth", "user {id} is now {} (changed by {})", role.as_str(), user.id);
    }
    let docu = users
        .find_one(doc! { "_id": &id }, None)
        .await?
        .ok_or(ApiError::NotFound("User"))?;
    Ok(Json(doc_to_user(&docu)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin(id: &str) -> AuthUser {
        AuthUser {
            id: id.into(),
            email: "boss@shop.test".into(),
            name: "Boss".into(),
            role: Role::Admin,
        }
    }

    #[test]
    fn admins_cannot_demote_themselves() {
        assert!(matches!(
            check_role_change(&admin("a1"), "a1", Role::User),
            Err(ApiError::Validation(_))
        ));
        assert!(check_role_change(&admin("a1"), "a1", Role::Admin).is_ok());
        assert!(check_role_change(&admin("a1"), "u7", Role::User).is_ok());
        assert!(check_role_change(&admin("a1"), "u7", Role::Admin).is_ok());
    }
}
