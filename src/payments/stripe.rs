use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use crate::config::StripeConfig;
use crate::error::{ApiError, ApiResult};

pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Malformed Stripe-Signature header")]
    Malformed,
    #[error("Stripe signature mismatch")]
    Mismatch,
    #[error("Stripe signature timestamp outside tolerance")]
    Stale,
}

impl From<SignatureError> for ApiError {
    fn from(e: SignatureError) -> Self {
        match e {
            SignatureError::Malformed => ApiError::validation(e.to_string()),
            SignatureError::Mismatch | SignatureError::Stale => ApiError::Unauthorized(e.to_string()),
        }
    }
}

/// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw body.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<&str> = None;
    let mut signatures: Vec<Vec<u8>> = vec![];
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => {
                if let Ok(bytes) = hex::decode(v) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    let ts: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }

    let matches = signatures.iter().any(|sig| {
        Hmac::<Sha256>::new_from_slice(secret.as_bytes())
            .map(|mut mac| {
                mac.update(timestamp.as_bytes());
                mac.update(b".");
                mac.update(payload);
                mac.verify_slice(sig).is_ok()
            })
            .unwrap_or(false)
    });
    if !matches {
        return Err(SignatureError::Mismatch);
    }
    if (now_unix - ts).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }
    Ok(())
}

/* ================== Webhook events ================== */

#[derive(Debug, Clone, PartialEq)]
pub enum StripeEvent {
    CheckoutCompleted { order_id: String, session_id: String },
    CheckoutExpired { order_id: String },
    Ignored(String),
}

pub fn parse_event(payload: &[u8]) -> ApiResult<StripeEvent> {
    let v: Value = serde_json::from_slice(payload)
        .map_err(|e| ApiError::validation(format!("Invalid Stripe event: {e}")))?;
    let kind = v.get("type").and_then(Value::as_str).unwrap_or_default();
    let object = v.pointer("/data/object");
    let order_id = object
        .and_then(|o| o.get("client_reference_id"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(match (kind, order_id) {
        ("checkout.session.completed", Some(order_id)) => StripeEvent::CheckoutCompleted {
            order_id,
            session_id: object
                .and_then(|o| o.get("id"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        },
        ("checkout.session.expired", Some(order_id)) => StripeEvent::CheckoutExpired { order_id },
        (other, _) => StripeEvent::Ignored(other.to_string()),
    })
}

/* ================== Checkout client ================== */

#[derive(Deserialize, Debug, Clone)]
pub struct CheckoutSession {
    pub id: String,
    pub url: Option<String>,
}

pub struct StripeClient<'a> {
    http: &'a reqwest::Client,
    cfg: &'a StripeConfig,
}

impl<'a> StripeClient<'a> {
    pub fn new(http: &'a reqwest::Client, cfg: &'a StripeConfig) -> Self {
        Self { http, cfg }
    }

    pub async fn create_checkout_session(
        &self,
        order_id: &str,
        total: f64,
        currency: &str,
        customer_email: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> ApiResult<CheckoutSession> {
        let form = session_form(order_id, total, currency, customer_email, success_url, cancel_url);
        let session: CheckoutSession = self
            .http
            .post(format!(
                "{}/v1/checkout/sessions",
                self.cfg.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.cfg.secret_key)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(target: "payments", "stripe session {} created for order {order_id}", session.id);
        Ok(session)
    }
}

fn session_form(
    order_id: &str,
    total: f64,
    currency: &str,
    customer_email: &str,
    success_url: &str,
    cancel_url: &str,
) -> Vec<(&'static str, String)> {
    vec![
        ("mode", "payment".into()),
        ("success_url", success_url.into()),
        ("cancel_url", cancel_url.into()),
        ("client_reference_id", order_id.into()),
        ("customer_email", customer_email.into()),
        ("metadata[order_id]", order_id.into()),
        ("line_items[0][quantity]", "1".into()),
        (
            "line_items[0][price_data][currency]",
            currency.to_ascii_lowercase(),
        ),
        (
            "line_items[0][price_data][unit_amount]",
            super::paymob::amount_cents(total).to_string(),
        ),
        (
            "line_items[0][price_data][product_data][name]",
            format!("Order {order_id}"),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test123secret456";

    fn sign(payload: &[u8], ts: i64) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{ts}.").as_bytes());
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    const NOW: i64 = 1_760_000_000;

    #[test]
    fn valid_signature_is_accepted() {
        let payload = br#"{"type":"checkout.session.completed"}"#;
        let header = format!("t={NOW},v1={}", sign(payload, NOW));
        assert_eq!(verify_signature(payload, &header, SECRET, NOW + 10), Ok(()));
    }

    #[test]
    fn any_v1_entry_may_match() {
        let payload = b"{}";
        let header = format!("t={NOW},v1=deadbeef,v1={}", sign(payload, NOW));
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn modified_payload_is_rejected() {
        let header = format!("t={NOW},v1={}", sign(b"{\"a\":1}", NOW));
        assert_eq!(
            verify_signature(b"{\"a\":2}", &header, SECRET, NOW),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn old_timestamp_is_rejected() {
        let payload = b"{}";
        let header = format!("t={NOW},v1={}", sign(payload, NOW));
        assert_eq!(
            verify_signature(payload, &header, SECRET, NOW + 600),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn malformed_headers() {
        for header in ["", "garbage", "v1=abcd", "t=1234567890", "t=abc,v1=00"] {
            assert_eq!(
                verify_signature(b"{}", header, SECRET, NOW),
                Err(SignatureError::Malformed),
                "header {header:?}"
            );
        }
    }

    #[test]
    fn completed_event_carries_order_reference() {
        let payload = br#"{"type":"checkout.session.completed",
            "data":{"object":{"id":"cs_test_1","client_reference_id":"ord-7"}}}"#;
        assert_eq!(
            parse_event(payload).unwrap(),
            StripeEvent::CheckoutCompleted {
                order_id: "ord-7".into(),
                session_id: "cs_test_1".into()
            }
        );
    }

    #[test]
    fn unrelated_events_are_ignored() {
        let payload = br#"{"type":"invoice.paid","data":{"object":{}}}"#;
        assert_eq!(
            parse_event(payload).unwrap(),
            StripeEvent::Ignored("invoice.paid".into())
        );
        assert!(parse_event(b"not json").is_err());
    }

    #[test]
    fn session_form_uses_minor_units() {
        let form = session_form("o1", 12.34, "EGP", "a@b.io", "s", "c");
        let get = |k: &str| form.iter().find(|(key, _)| *key == k).map(|(_, v)| v.as_str());
        assert_eq!(get("line_items[0][price_data][unit_amount]"), Some("1234"));
        assert_eq!(get("line_items[0][price_data][currency]"), Some("egp"));
        assert_eq!(get("client_reference_id"), Some("o1"));
    }
}
