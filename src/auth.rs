use argon2::password_hash::rand_core::OsRng;
use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::config::JwtSecrets;
use crate::error::{ApiError, ApiResult};

pub const EMAIL_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;
pub const RESET_CODE_TTL_SECS: i64 = 10 * 60;
const CONFIRM_EMAIL_PURPOSE: &str = "confirm-email";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    /// Authorization scheme a token of this role travels under.
    pub fn scheme(self) -> &'static str {
        match self {
            Role::User => "Bearer",
            Role::Admin => "Admin",
        }
    }

    fn from_scheme(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("bearer") {
            Some(Role::User)
        } else if scheme.eq_ignore_ascii_case("admin") {
            Some(Role::Admin)
        } else {
            None
        }
    }

    fn secret(self, secrets: &JwtSecrets) -> &str {
        match self {
            Role::User => &secrets.user,
            Role::Admin => &secrets.admin,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EmailClaims {
    pub sub: String,
    pub email: String,
    pub purpose: String,
    pub exp: i64,
}

fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/* ================== Passwords ================== */

pub fn hash_password(plain: &str) -> ApiResult<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|_| ApiError::Internal("Failed to hash password".into()))
}

pub fn verify_password(plain: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|parsed| {
            Argon2::default()
                .verify_password(plain.as_bytes(), &parsed)
                .is_ok()
        })
        .unwrap_or(false)
}

/* ================== Session tokens ================== */

pub fn issue_token(
    user_id: &str,
    email: &str,
    role: Role,
    secrets: &JwtSecrets,
    ttl_secs: i64,
) -> ApiResult<String> {
    let iat = unix_now();
    let claims = Claims {
        sub: user_id.to_string(),
        email: email.to_string(),
        role,
        iat,
        exp: iat + ttl_secs,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(role.secret(secrets).as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("Failed to sign token: {e}")))
}

/// Verifies a raw `Authorization` header value (`<Scheme> <jwt>`).
pub fn verify_authorization(header: &str, secrets: &JwtSecrets) -> ApiResult<Claims> {
    let (scheme, token) = header
        .trim()
        .split_once(' ')
        .ok_or_else(|| ApiError::Unauthorized("Malformed Authorization header".into()))?;
    let role = Role::from_scheme(scheme)
        .ok_or_else(|| ApiError::Unauthorized("Unknown authorization scheme".into()))?;

    let data = decode::<Claims>(
        token.trim(),
        &DecodingKey::from_secret(role.secret(secrets).as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;

    if data.claims.role != role {
        return Err(ApiError::Unauthorized("Token role mismatch".into()));
    }
    Ok(data.claims)
}

/* ================== Email confirmation ================== */

pub fn issue_email_token(user_id: &str, email: &str, secrets: &JwtSecrets) -> ApiResult<String> {
    let claims = EmailClaims {
        sub: user_id.to_string(),
        email: email.to_string(),
        purpose: CONFIRM_EMAIL_PURPOSE.to_string(),
        exp: unix_now() + EMAIL_TOKEN_TTL_SECS,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secrets.email.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("Failed to sign token: {e}")))
}

pub fn verify_email_token(token: &str, secrets: &JwtSecrets) -> ApiResult<EmailClaims> {
    let data = decode::<EmailClaims>(
        token,
        &DecodingKey::from_secret(secrets.email.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )?;
    if data.claims.purpose != CONFIRM_EMAIL_PURPOSE {
        return Err(ApiError::Unauthorized("Wrong token purpose".into()));
    }
    Ok(data.claims)
}

/* ================== Password reset codes ================== */

pub fn reset_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

pub fn hash_reset_code(code: &str) -> String {
    hex::encode(Sha256::digest(code.trim().as_bytes()))
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

pub fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets() -> JwtSecrets {
        JwtSecrets {
            user: "u-secret".into(),
            admin: "a-secret".into(),
            email: "e-secret".into(),
        }
    }

    #[test]
    fn password_hash_verifies_only_the_original() {
        let hash = hash_password("correct horse").unwrap();
        assert!(verify_password("correct horse", &hash));
        assert!(!verify_password("wrong horse", &hash));
        assert!(!verify_password("correct horse", "not-a-phc-string"));
    }

    #[test]
    fn user_token_verifies_under_bearer_scheme() {
        let s = secrets();
        let token = issue_token("u1", "a@b.io", Role::User, &s, 60).unwrap();
        let claims = verify_authorization(&format!("Bearer {token}"), &s).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.role, Role::User);
    }

    #[test]
    fn admin_token_is_signed_with_admin_secret() {
        let s = secrets();
        let token = issue_token("a1", "admin@b.io", Role::Admin, &s, 60).unwrap();
        assert!(verify_authorization(&format!("Admin {token}"), &s).is_ok());
        // Presented under the user scheme it is checked against the user secret.
        assert!(verify_authorization(&format!("Bearer {token}"), &s).is_err());
    }

    #[test]
    fn user_token_cannot_claim_admin_scheme() {
        let s = JwtSecrets {
            user: "same".into(),
            admin: "same".into(),
            email: "e".into(),
        };
        let token = issue_token("u1", "a@b.io", Role::User, &s, 60).unwrap();
        assert!(verify_authorization(&format!("Admin {token}"), &s).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let s = secrets();
        let token = issue_token("u1", "a@b.io", Role::User, &s, -3600).unwrap();
        assert!(verify_authorization(&format!("Bearer {token}"), &s).is_err());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let s = secrets();
        assert!(verify_authorization("", &s).is_err());
        assert!(verify_authorization("Basic abc", &s).is_err());
        assert!(verify_authorization("Bearer not.a.jwt", &s).is_err());
    }

    #[test]
    fn email_token_roundtrip_and_purpose() {
        let s = secrets();
        let token = issue_email_token("u1", "a@b.io", &s).unwrap();
        let claims = verify_email_token(&token, &s).unwrap();
        assert_eq!(claims.email, "a@b.io");

        let session = issue_token("u1", "a@b.io", Role::User, &s, 60).unwrap();
        assert!(verify_email_token(&session, &s).is_err());
    }

    #[test]
    fn reset_codes_are_six_digits() {
        for _ in 0..50 {
            let code = reset_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
        assert_eq!(hash_reset_code("123456"), hash_reset_code(" 123456 "));
        assert_ne!(hash_reset_code("123456"), hash_reset_code("123457"));
    }

    #[test]
    fn email_shape_check() {
        assert!(looks_like_email("jane@shop.example"));
        assert!(!looks_like_email("jane@localhost"));
        assert!(!looks_like_email("@shop.example"));
        assert!(!looks_like_email("jane.shop.example"));
        assert_eq!(normalize_email(" Jane@Shop.IO "), "jane@shop.io");
    }
}
