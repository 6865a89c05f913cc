//! Stripe Checkout sessions and webhook verification.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;

use super::{CheckoutSession, PaymentError, Result, SettlementOutcome};
use crate::config::StripeConfig;
use crate::db::{Course, Gateway, Payment, PaymentStatus, User};

type HmacSha256 = Hmac<Sha256>;

pub struct StripeGateway {
    config: StripeConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeSessionObject,
}

#[derive(Debug, Deserialize)]
struct StripeSessionObject {
    id: String,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    payment_status: Option<String>,
    payment_intent: Option<String>,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub fn webhook_secret(&self) -> &str {
        &self.config.webhook_secret
    }

    pub fn signature_tolerance(&self) -> i64 {
        self.config.signature_tolerance_seconds
    }

    pub async fn create_checkout_session(
        &self,
        payment: &Payment,
        course: &Course,
        user: &User,
        public_url: &str,
    ) -> Result<CheckoutSession> {
        let params: Vec<(&str, String)> = vec![
            ("mode", "payment".into()),
            ("line_items[0][quantity]", "1".into()),
            (
                "line_items[0][price_data][currency]",
                payment.currency.to_lowercase(),
            ),
            (
                "line_items[0][price_data][unit_amount]",
                payment.amount_minor.to_string(),
            ),
            ("line_items[0][price_data][product_data][name]", course.title.clone()),
            ("client_reference_id", payment.transaction_id.clone()),
            ("customer_email", user.email.clone()),
            ("metadata[payment_id]", payment.id.clone()),
            ("metadata[transaction_id]", payment.transaction_id.clone()),
            ("metadata[course_id]", course.id.clone()),
            ("metadata[user_id]", user.id.clone()),
            (
                "success_url",
                format!("{}/payments/success?payment_id={}", public_url, payment.id),
            ),
            (
                "cancel_url",
                format!("{}/payments/cancel?payment_id={}", public_url, payment.id),
            ),
        ];

        let url = format!(
            "{}/v1/checkout/sessions",
            self.config.api_base_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.secret_key)
            .form(&params)
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("Stripe unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Gateway(format!("Stripe API error: {} - {}", status, body)));
        }

        let session: StripeCheckoutSession = response
            .json()
            .await
            .map_err(|e| PaymentError::Gateway(format!("Invalid Stripe response: {}", e)))?;
        let redirect_url = session
            .url
            .ok_or_else(|| PaymentError::Gateway("Stripe session has no url".to_string()))?;

        Ok(CheckoutSession {
            session_id: session.id,
            redirect_url,
        })
    }
}

/// Check a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw body.
/// Rejects timestamps older than `tolerance_seconds` relative to `now`.
pub fn verify_stripe_signature(
    secret: &str,
    header: &str,
    payload: &[u8],
    now: i64,
    tolerance_seconds: i64,
) -> Result<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(PaymentError::InvalidSignature)?;
    if signatures.is_empty() {
        return Err(PaymentError::InvalidSignature);
    }
    if now - timestamp > tolerance_seconds {
        tracing::warn!(timestamp, now, "Stripe signature timestamp outside tolerance");
        return Err(PaymentError::InvalidSignature);
    }

    for signature in signatures {
        let Ok(expected) = hex::decode(signature) else {
            continue;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return Err(PaymentError::InvalidSignature);
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    Err(PaymentError::InvalidSignature)
}

/// Turn a verified event body into a settlement outcome. Events that do not
/// settle a checkout yield `None` and are acknowledged without action.
pub fn parse_event(payload: &[u8]) -> Result<Option<SettlementOutcome>> {
    let event: StripeEvent = serde_json::from_slice(payload)
        .map_err(|e| PaymentError::InvalidPayload(format!("Stripe event: {}", e)))?;
    let session = &event.data.object;

    let status = match event.event_type.as_str() {
        "checkout.session.completed" => match session.payment_status.as_deref() {
            Some("paid") | Some("no_payment_required") => PaymentStatus::Paid,
            // Delayed methods settle later through async_payment_succeeded
            _ => return Ok(None),
        },
        "checkout.session.async_payment_succeeded" => PaymentStatus::Paid,
        "checkout.session.async_payment_failed" => PaymentStatus::Failed,
        "checkout.session.expired" => PaymentStatus::Cancelled,
        other => {
            tracing::debug!(event_type = %other, "Ignoring Stripe event");
            return Ok(None);
        }
    };

    let transaction_id = session
        .client_reference_id
        .clone()
        .or_else(|| session.metadata.get("transaction_id").cloned())
        .ok_or_else(|| PaymentError::InvalidPayload("Stripe session has no transaction reference".into()))?;

    Ok(Some(SettlementOutcome {
        gateway: Gateway::Stripe,
        external_id: event.id,
        transaction_id,
        status,
        gateway_transaction_id: Some(
            session
                .payment_intent
                .clone()
                .unwrap_or_else(|| session.id.clone()),
        ),
        payload: Some(String::from_utf8_lossy(payload).into_owned()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;
    use crate::test_support::{create_course, create_user, FakeServer};
    use axum::{extract::Form, routing::post, Json, Router};
    use serde_json::json;

    fn sign(secret: &str, timestamp: i64, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.", timestamp).as_bytes());
        mac.update(payload);
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", 1_700_000_000, body);
        assert!(verify_stripe_signature("whsec_test", &header, body, 1_700_000_100, 300).is_ok());
    }

    #[test]
    fn test_signature_rejections() {
        let body = br#"{"id":"evt_1"}"#;
        let header = sign("whsec_test", 1_700_000_000, body);

        // wrong secret
        assert!(verify_stripe_signature("other", &header, body, 1_700_000_000, 300).is_err());
        // tampered body
        assert!(verify_stripe_signature("whsec_test", &header, b"{}", 1_700_000_000, 300).is_err());
        // stale
        assert!(verify_stripe_signature("whsec_test", &header, body, 1_700_000_301, 300).is_err());
        // malformed
        assert!(verify_stripe_signature("whsec_test", "garbage", body, 1_700_000_000, 300).is_err());
    }

    #[test]
    fn test_any_v1_signature_may_match() {
        let body = b"{}";
        let good = sign("whsec_test", 10, body);
        let v1 = good.split_once(",v1=").unwrap().1;
        let header = format!("t=10,v1=deadbeef,v1={}", v1);
        assert!(verify_stripe_signature("whsec_test", &header, body, 10, 300).is_ok());
    }

    fn event(kind: &str, payment_status: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "id": "evt_123",
            "type": kind,
            "data": {"object": {
                "id": "cs_test_1",
                "client_reference_id": "txn-1",
                "metadata": {"payment_id": "p1"},
                "payment_status": payment_status,
                "payment_intent": "pi_1"
            }}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_completed_event() {
        let outcome = parse_event(&event("checkout.session.completed", "paid"))
            .unwrap()
            .unwrap();
        assert_eq!(outcome.external_id, "evt_123");
        assert_eq!(outcome.transaction_id, "txn-1");
        assert_eq!(outcome.status, PaymentStatus::Paid);
        assert_eq!(outcome.gateway_transaction_id.as_deref(), Some("pi_1"));
    }

    #[test]
    fn test_parse_other_events() {
        assert!(parse_event(&event("checkout.session.completed", "unpaid"))
            .unwrap()
            .is_none());
        assert_eq!(
            parse_event(&event("checkout.session.expired", "unpaid"))
                .unwrap()
                .unwrap()
                .status,
            PaymentStatus::Cancelled
        );
        assert!(parse_event(&event("customer.created", "")).unwrap().is_none());
        assert!(parse_event(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_create_checkout_session() {
        let server = FakeServer::start(|hits| {
            Router::new().route(
                "/v1/checkout/sessions",
                post(move |Form(form): Form<HashMap<String, String>>| {
                    hits.hit("sessions");
                    async move {
                        assert_eq!(form["line_items[0][price_data][unit_amount]"], "150000");
                        assert_eq!(form["line_items[0][price_data][currency]"], "bdt");
                        Json(json!({
                            "id": "cs_test_1",
                            "url": format!("https://checkout.stripe.test/{}", form["client_reference_id"])
                        }))
                    }
                }),
            )
        })
        .await;

        let db = crate::db::init_memory().await.unwrap();
        let payment = crate::payments::tests::pending_payment(&db, Gateway::Stripe).await;
        let user = create_user(&db, Role::Student, "payer@example.com", None).await;
        let course = create_course(&db, "Tajweed", Some(150_000), 30).await;

        let gateway = StripeGateway::new(StripeConfig {
            secret_key: "sk_test".into(),
            webhook_secret: "whsec".into(),
            api_base_url: server.url(),
            signature_tolerance_seconds: 300,
        });
        let session = gateway
            .create_checkout_session(&payment, &course, &user, "http://localhost:8000")
            .await
            .unwrap();

        assert_eq!(session.session_id, "cs_test_1");
        assert!(session.redirect_url.ends_with(&payment.transaction_id));
        assert_eq!(server.hits("sessions"), 1);
    }
}
