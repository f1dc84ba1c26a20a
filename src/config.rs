use std::{env, fmt::Display, str::FromStr};

use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct JwtSecrets {
    pub user: String,
    pub admin: String,
    pub email: String,
}

#[derive(Clone, Debug)]
pub struct PaymobConfig {
    pub base_url: String,
    pub api_key: String,
    pub integration_id: i64,
    pub iframe_id: String,
    pub hmac_secret: String,
}

#[derive(Clone, Debug)]
pub struct StripeConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
}

/// Account promoted to admin at startup, from `ADMIN_EMAIL` and `ADMIN_PASSWORD`.
#[derive(Clone, Debug, PartialEq)]
pub struct AdminSeed {
    pub email: String,
    pub password: String,
    pub name: String,
}

impl AdminSeed {
    fn from_parts(
        email: Option<String>,
        password: Option<String>,
        name: Option<String>,
    ) -> Option<Self> {
        match (email, password) {
            (Some(email), Some(password)) => Some(Self {
                email: email.trim().to_ascii_lowercase(),
                password,
                name: name.unwrap_or_else(|| "Admin".into()),
            }),
            (None, None) => None,
            _ => {
                warn!("ADMIN_EMAIL and ADMIN_PASSWORD must be set together, admin seed skipped");
                None
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub port: u16,
    pub public_base_url: String,
    pub currency: String,
    pub jwt: JwtSecrets,
    pub jwt_ttl_secs: i64,
    pub tax_price: f64,
    pub shipping_price: f64,
    /// `None` when the provider's credentials are not configured.
    pub paymob: Option<PaymobConfig>,
    pub stripe: Option<StripeConfig>,
    pub admin_seed: Option<AdminSeed>,
}

impl AppConfig {
    pub fn load() -> Self {
        let port = try_load("PORT", 3000);
        Self {
            port,
            public_base_url: var("PUBLIC_BASE_URL")
                .unwrap_or_else(|| format!("http://localhost:{port}")),
            currency: var("CURRENCY").unwrap_or_else(|| "EGP".into()),
            jwt: JwtSecrets {
                user: secret("JWT_USER_SECRET", "dev-user-secret"),
                admin: secret("JWT_ADMIN_SECRET", "dev-admin-secret"),
                email: secret("JWT_EMAIL_SECRET", "dev-email-secret"),
            },
            jwt_ttl_secs: try_load("JWT_TTL_SECS", 86_400),
            tax_price: try_load("TAX_PRICE", 0.0),
            shipping_price: try_load("SHIPPING_PRICE", 0.0),
            paymob: load_paymob(),
            stripe: load_stripe(),
            admin_seed: AdminSeed::from_parts(
                var("ADMIN_EMAIL"),
                var("ADMIN_PASSWORD"),
                var("ADMIN_NAME"),
            ),
        }
    }
}

fn load_paymob() -> Option<PaymobConfig> {
    let api_key = var("PAYMOB_API_KEY")?;
    let hmac_secret = var("PAYMOB_HMAC_SECRET")?;
    let integration_id = var("PAYMOB_INTEGRATION_ID")?.trim().parse().ok().or_else(|| {
        warn!("PAYMOB_INTEGRATION_ID is not a number, Paymob disabled");
        None
    })?;
    Some(PaymobConfig {
        base_url: var("PAYMOB_BASE_URL").unwrap_or_else(|| "https://accept.paymob.com/api".into()),
        api_key,
        integration_id,
        iframe_id: var("PAYMOB_IFRAME_ID").unwrap_or_default(),
        hmac_secret,
    })
}

fn load_stripe() -> Option<StripeConfig> {
    Some(StripeConfig {
        base_url: var("STRIPE_BASE_URL").unwrap_or_else(|| "https://api.stripe.com".into()),
        secret_key: var("STRIPE_SECRET_KEY")?,
        webhook_secret: var("STRIPE_WEBHOOK_SECRET")?,
    })
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn secret(key: &str, dev_default: &str) -> String {
    var(key).unwrap_or_else(|| {
        warn!("{key} not set, using development default");
        dev_default.to_string()
    })
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match var(key) {
        None => {
            info!("{key} not set, using default: {default}");
            default
        }
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
            default
        }),
    }
}

#[cfg(test)]
impl AppConfig {
    pub fn for_tests() -> Self {
        Self {
            port: 0,
            public_base_url: "http://localhost:3000".into(),
            currency: "EGP".into(),
            jwt: JwtSecrets {
                user: "test-user-secret".into(),
                admin: "test-admin-secret".into(),
                email: "test-email-secret".into(),
            },
            jwt_ttl_secs: 3600,
            tax_price: 0.0,
            shipping_price: 0.0,
            paymob: Some(PaymobConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: "k".into(),
                integration_id: 1,
                iframe_id: "1".into(),
                hmac_secret: "paymob-test-secret".into(),
            }),
            stripe: Some(StripeConfig {
                base_url: "http://127.0.0.1:9".into(),
                secret_key: "sk_test".into(),
                webhook_secret: "whsec_test".into(),
            }),
            admin_seed: None,
        }
    }
}
