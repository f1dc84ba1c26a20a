//! Paymob Accept: hosted-checkout flow and transaction callback verification.
//!
//! Checkout is three calls (auth token, order registration, payment key)
//! followed by a redirect to the hosted iframe. Paymob then reports the
//! outcome twice: a server-to-server "transaction processed" POST carrying
//! the transaction as JSON, and a browser redirect carrying the same fields
//! flattened into the query string. Both are signed with HMAC-SHA512 over a
//! fixed concatenation of 20 fields.

use std::collections::HashMap;

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha512;
use tracing::info;

use crate::config::PaymobConfig;
use crate::error::ApiResult;

/// `(path in the JSON transaction, key in the redirect query)`, in signing order.
const HMAC_FIELDS: [(&str, &str); 20] = [
    ("amount_cents", "amount_cents"),
    ("created_at", "created_at"),
    ("currency", "currency"),
    ("error_occured", "error_occured"),
    ("has_parent_transaction", "has_parent_transaction"),
    ("id", "id"),
    ("integration_id", "integration_id"),
    ("is_3d_secure", "is_3d_secure"),
    ("is_auth", "is_auth"),
    ("is_capture", "is_capture"),
    ("is_refunded", "is_refunded"),
    ("is_standalone_payment", "is_standalone_payment"),
    ("is_voided", "is_voided"),
    ("order.id", "order"),
    ("owner", "owner"),
    ("pending", "pending"),
    ("source_data.pan", "source_data.pan"),
    ("source_data.sub_type", "source_data.sub_type"),
    ("source_data.type", "source_data.type"),
    ("success", "success"),
];

const PAYMENT_KEY_TTL_SECS: i64 = 3600;

/* ================== Callback parsing ================== */

/// Outcome of a Paymob transaction, from either callback flavour.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymobTransaction {
    pub transaction_id: String,
    pub paymob_order_id: String,
    pub merchant_order_id: Option<String>,
    pub success: bool,
    pub pending: bool,
    pub amount_cents: i64,
    signing_string: String,
}

impl PaymobTransaction {
    /// Reads the `obj` of a processed-callback body.
    pub fn from_json(obj: &Value) -> Self {
        let signing_string = HMAC_FIELDS
            .iter()
            .map(|(path, _)| render(lookup(obj, path)))
            .collect();
        PaymobTransaction {
            transaction_id: render(lookup(obj, "id")),
            paymob_order_id: render(lookup(obj, "order.id")),
            merchant_order_id: lookup(obj, "order.merchant_order_id")
                .map(|v| render(Some(v)))
                .filter(|s| !s.is_empty()),
            success: truthy(&render(lookup(obj, "success"))),
            pending: truthy(&render(lookup(obj, "pending"))),
            amount_cents: lookup(obj, "amount_cents")
                .and_then(Value::as_i64)
                .unwrap_or(0),
            signing_string,
        }
    }

    /// Reads the flattened query of the browser redirect.
    pub fn from_query(q: &HashMap<String, String>) -> Self {
        let get = |k: &str| q.get(k).cloned().unwrap_or_default();
        let signing_string = HMAC_FIELDS.iter().map(|(_, key)| get(*key)).collect();
        PaymobTransaction {
            transaction_id: get("id"),
            paymob_order_id: get("order"),
            merchant_order_id: q
                .get("merchant_order_id")
                .cloned()
                .filter(|s| !s.is_empty()),
            success: truthy(&get("success")),
            pending: truthy(&get("pending")),
            amount_cents: get("amount_cents").trim().parse().unwrap_or(0),
            signing_string,
        }
    }

    pub fn signing_string(&self) -> &str {
        &self.signing_string
    }

    /// Constant-time check of the hex digest Paymob sent.
    pub fn verify(&self, secret: &str, received_hmac: &str) -> bool {
        let Ok(expected) = hex::decode(received_hmac.trim()) else {
            return false;
        };
        let Ok(mut mac) = Hmac::<Sha512>::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(self.signing_string.as_bytes());
        mac.verify_slice(&expected).is_ok()
    }
}

fn lookup<'a>(v: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(v, |cur, key| cur.get(key))
}

fn render(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

fn truthy(s: &str) -> bool {
    s.trim().eq_ignore_ascii_case("true")
}

/* ================== Checkout client ================== */

#[derive(Debug, Clone)]
pub struct PaymobCheckout {
    pub paymob_order_id: String,
    pub redirect_url: String,
}

pub struct BillingData<'a> {
    pub first_name: &'a str,
    pub last_name: &'a str,
    pub email: &'a str,
    pub phone_number: &'a str,
    pub street: &'a str,
    pub city: &'a str,
    pub postal_code: Option<&'a str>,
}

#[derive(Deserialize)]
struct TokenResp {
    token: String,
}

#[derive(Deserialize)]
struct OrderResp {
    id: Value,
}

pub struct PaymobClient<'a> {
    http: &'a reqwest::Client,
    cfg: &'a PaymobConfig,
}

pub fn amount_cents(total: f64) -> i64 {
    (total * 100.0).round() as i64
}

impl<'a> PaymobClient<'a> {
    pub fn new(http: &'a reqwest::Client, cfg: &'a PaymobConfig) -> Self {
        Self { http, cfg }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), path)
    }

    async fn authenticate(&self) -> ApiResult<String> {
        let resp: TokenResp = self
            .http
            .post(self.url("auth/tokens"))
            .json(&json!({ "api_key": self.cfg.api_key }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.token)
    }

    async fn register_order(
        &self,
        auth_token: &str,
        cents: i64,
        currency: &str,
        merchant_order_id: &str,
    ) -> ApiResult<String> {
        let resp: OrderResp = self
            .http
            .post(self.url("ecommerce/orders"))
            .json(&json!({
                "auth_token": auth_token,
                "delivery_needed": false,
                "amount_cents": cents,
                "currency": currency,
                "merchant_order_id": merchant_order_id,
                "items": [],
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(render(Some(&resp.id)))
    }

    async fn payment_key(
        &self,
        auth_token: &str,
        paymob_order_id: &str,
        cents: i64,
        currency: &str,
        billing: &BillingData<'_>,
    ) -> ApiResult<String> {
        let or_na = |s: &str| if s.trim().is_empty() { "NA".to_string() } else { s.to_string() };
        let resp: TokenResp = self
            .http
            .post(self.url("acceptance/payment_keys"))
            .json(&json!({
                "auth_token": auth_token,
                "amount_cents": cents,
                "expiration": PAYMENT_KEY_TTL_SECS,
                "order_id": paymob_order_id,
                "currency": currency,
                "integration_id": self.cfg.integration_id,
                "billing_data": {
                    "first_name": or_na(billing.first_name),
                    "last_name": or_na(billing.last_name),
                    "email": or_na(billing.email),
                    "phone_number": or_na(billing.phone_number),
                    "street": or_na(billing.street),
                    "city": or_na(billing.city),
                    "postal_code": or_na(billing.postal_code.unwrap_or_default()),
                    "apartment": "NA",
                    "floor": "NA",
                    "building": "NA",
                    "shipping_method": "NA",
                    "country": "NA",
                    "state": "NA",
                },
            }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.token)
    }

    pub fn iframe_url(&self, payment_token: &str) -> String {
        format!(
            "{}?payment_token={}",
            self.url(&format!("acceptance/iframes/{}", self.cfg.iframe_id)),
            payment_token
        )
    }

    /// Runs the full hosted-checkout handshake for one order.
    pub async fn checkout(
        &self,
        merchant_order_id: &str,
        total: f64,
        currency: &str,
        billing: &BillingData<'_>,
    ) -> ApiResult<PaymobCheckout> {
        let cents = amount_cents(total);
        let auth_token = self.authenticate().await?;
        let paymob_order_id = self
            .register_order(&auth_token, cents, currency, merchant_order_id)
            .await?;
        let payment_token = self
            .payment_key(&auth_token, &paymob_order_id, cents, currency, billing)
            .await?;
        info!(
            target: "payments",
            "paymob checkout ready order={merchant_order_id} paymob_order={paymob_order_id} cents={cents}"
        );
        Ok(PaymobCheckout {
            redirect_url: self.iframe_url(&payment_token),
            paymob_order_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "paymob-test-secret";

    fn sign(secret: &str, signing_string: &str) -> Result<String, hmac::digest::InvalidLength> {
        let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())?;
        mac.update(signing_string.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn sample_obj() -> Value {
        json!({
            "id": 192036465,
            "pending": false,
            "amount_cents": 100000,
            "success": true,
            "is_auth": false,
            "is_capture": false,
            "is_standalone_payment": true,
            "is_voided": false,
            "is_refunded": false,
            "is_3d_secure": true,
            "integration_id": 4097558,
            "has_parent_transaction": false,
            "order": { "id": 217503754, "merchant_order_id": "ord-42" },
            "created_at": "2024-06-13T11:33:44.592345",
            "currency": "EGP",
            "source_data": { "pan": "2346", "type": "card", "sub_type": "MasterCard" },
            "error_occured": false,
            "owner": 1698394,
        })
    }

    #[test]
    fn signing_string_follows_field_order() {
        let tx = PaymobTransaction::from_json(&sample_obj());
        assert_eq!(
            tx.signing_string(),
            "1000002024-06-13T11:33:44.592345EGPfalsefalse1920364654097558\
             truefalsefalsefalsetruefalse2175037541698394false2346MasterCardcardtrue"
        );
    }

    #[test]
    fn json_callback_fields_are_extracted() {
        let tx = PaymobTransaction::from_json(&sample_obj());
        assert_eq!(tx.transaction_id, "192036465");
        assert_eq!(tx.paymob_order_id, "217503754");
        assert_eq!(tx.merchant_order_id.as_deref(), Some("ord-42"));
        assert!(tx.success);
        assert!(!tx.pending);
        assert_eq!(tx.amount_cents, 100000);
    }

    #[test]
    fn valid_hmac_is_accepted() {
        let tx = PaymobTransaction::from_json(&sample_obj());
        let mac = sign(SECRET, tx.signing_string()).unwrap();
        assert_eq!(mac.len(), 128);
        assert!(tx.verify(SECRET, &mac));
        assert!(tx.verify(SECRET, &mac.to_uppercase()));
    }

    #[test]
    fn tampered_payload_or_wrong_secret_is_rejected() {
        let tx = PaymobTransaction::from_json(&sample_obj());
        let mac = sign(SECRET, tx.signing_string()).unwrap();
        assert!(!tx.verify("other-secret", &mac));
        assert!(!tx.verify(SECRET, "zz-not-hex"));
        assert!(!tx.verify(SECRET, ""));

        let mut obj = sample_obj();
        obj["amount_cents"] = json!(1);
        let forged = PaymobTransaction::from_json(&obj);
        assert!(!forged.verify(SECRET, &mac));
    }

    #[test]
    fn redirect_query_signs_the_same_as_json() {
        let obj = sample_obj();
        let json_tx = PaymobTransaction::from_json(&obj);

        let mut q = HashMap::new();
        for (path, key) in HMAC_FIELDS {
            q.insert(key.to_string(), render(lookup(&obj, path)));
        }
        q.insert("merchant_order_id".into(), "ord-42".into());
        q.insert("hmac".into(), "ignored".into());
        let query_tx = PaymobTransaction::from_query(&q);

        assert_eq!(query_tx.signing_string(), json_tx.signing_string());
        assert_eq!(query_tx.paymob_order_id, "217503754");
        assert_eq!(query_tx.merchant_order_id.as_deref(), Some("ord-42"));
        assert!(query_tx.success);

        let mac = sign(SECRET, json_tx.signing_string()).unwrap();
        assert!(query_tx.verify(SECRET, &mac));
    }

    #[test]
    fn missing_fields_render_empty() {
        let tx = PaymobTransaction::from_json(&json!({ "success": false }));
        assert_eq!(tx.signing_string(), "false");
        assert!(!tx.success);
        assert_eq!(tx.merchant_order_id, None);
    }

    #[test]
    fn cents_rounding() {
        assert_eq!(amount_cents(19.99), 1999);
        assert_eq!(amount_cents(150.0), 15000);
    }

    #[test]
    fn iframe_url_embeds_token() {
        let cfg = PaymobConfig {
            base_url: "https://accept.paymob.com/api/".into(),
            api_key: "k".into(),
            integration_id: 1,
            iframe_id: "777".into(),
            hmac_secret: SECRET.into(),
        };
        let http = reqwest::Client::new();
        let client = PaymobClient::new(&http, &cfg);
        assert_eq!(
            client.iframe_url("tok"),
            "https://accept.paymob.com/api/acceptance/iframes/777?payment_token=tok"
        );
    }
}
