//! SSLCommerz hosted checkout and server-side validation.
//!
//! Callback form posts are never trusted on their own: a success or IPN post is only
//! acted on after the validation API confirms the `val_id` for our transaction and amount.

use serde::Deserialize;
use std::time::Duration;

use super::{minor_to_decimal, parse_amount_minor, CheckoutSession, PaymentError, Result, SettlementOutcome};
use crate::config::SslCommerzConfig;
use crate::db::{Course, Gateway, Payment, PaymentStatus, User};

pub struct SslCommerzGateway {
    config: SslCommerzConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    status: String,
    #[serde(rename = "GatewayPageURL")]
    gateway_page_url: Option<String>,
    sessionkey: Option<String>,
    failedreason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ValidationResponse {
    status: String,
    tran_id: Option<String>,
    amount: Option<String>,
    bank_tran_id: Option<String>,
}

/// Fields SSLCommerz posts back to the success, fail, cancel and IPN URLs
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackForm {
    pub tran_id: Option<String>,
    pub val_id: Option<String>,
    pub status: Option<String>,
    pub amount: Option<String>,
    /// Our payment id, echoed back
    pub value_a: Option<String>,
}

impl SslCommerzGateway {
    pub fn new(config: SslCommerzConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    pub async fn init_session(
        &self,
        payment: &Payment,
        course: &Course,
        user: &User,
        public_url: &str,
    ) -> Result<CheckoutSession> {
        let callback = |kind: &str| format!("{}/webhooks/sslcommerz/{}", public_url, kind);
        let params: Vec<(&str, String)> = vec![
            ("store_id", self.config.store_id.clone()),
            ("store_passwd", self.config.store_password.clone()),
            ("total_amount", minor_to_decimal(payment.amount_minor)),
            ("currency", payment.currency.clone()),
            ("tran_id", payment.transaction_id.clone()),
            ("success_url", callback("success")),
            ("fail_url", callback("fail")),
            ("cancel_url", callback("cancel")),
            ("ipn_url", callback("ipn")),
            ("cus_name", user.full_name()),
            ("cus_email", user.email.clone()),
            ("cus_phone", user.phone_number.clone().unwrap_or_default()),
            ("cus_add1", "N/A".into()),
            ("cus_city", "Dhaka".into()),
            ("cus_country", "Bangladesh".into()),
            ("shipping_method", "NO".into()),
            ("product_name", course.title.clone()),
            ("product_category", "Online Course".into()),
            ("product_profile", "general".into()),
            ("value_a", payment.id.clone()),
        ];

        let url = format!("{}/gwprocess/v4/api.php", self.config.resolved_base_url());
        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("SSLCommerz unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(PaymentError::Gateway(format!(
                "SSLCommerz API error: {}",
                response.status()
            )));
        }

        let init: InitResponse = response
            .json()
            .await
            .map_err(|e| PaymentError::Gateway(format!("Invalid SSLCommerz response: {}", e)))?;

        match (init.status.as_str(), init.gateway_page_url) {
            ("SUCCESS", Some(redirect_url)) if !redirect_url.is_empty() => Ok(CheckoutSession {
                session_id: init.sessionkey.unwrap_or_default(),
                redirect_url,
            }),
            _ => Err(PaymentError::Gateway(format!(
                "SSLCommerz session rejected: {}",
                init.failedreason.unwrap_or(init.status)
            ))),
        }
    }

    /// Confirm a success/IPN callback with the validation API. The validated
    /// transaction must be ours and match the amount we charged.
    pub async fn validate(&self, form: &CallbackForm, payment: &Payment) -> Result<SettlementOutcome> {
        let val_id = form
            .val_id
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| PaymentError::InvalidPayload("missing val_id".into()))?;

        let url = format!(
            "{}/validator/api/validationserverAPI.php",
            self.config.resolved_base_url()
        );
        let response = self
            .client
            .get(&url)
            .query(&[
                ("val_id", val_id),
                ("store_id", self.config.store_id.as_str()),
                ("store_passwd", self.config.store_password.as_str()),
                ("format", "json"),
            ])
            .send()
            .await
            .map_err(|e| PaymentError::Gateway(format!("SSLCommerz unreachable: {}", e)))?;

        if !response.status().is_success() {
            return Err(PaymentError::Gateway(format!(
                "SSLCommerz validation error: {}",
                response.status()
            )));
        }

        let raw = response
            .text()
            .await
            .map_err(|e| PaymentError::Gateway(e.to_string()))?;
        let validation: ValidationResponse = serde_json::from_str(&raw)
            .map_err(|e| PaymentError::Gateway(format!("Invalid SSLCommerz validation: {}", e)))?;

        if !matches!(validation.status.as_str(), "VALID" | "VALIDATED") {
            return Err(PaymentError::ValidationFailed(format!(
                "status {}",
                validation.status
            )));
        }
        if validation.tran_id.as_deref() != Some(payment.transaction_id.as_str()) {
            return Err(PaymentError::ValidationFailed("transaction id mismatch".into()));
        }
        let amount = validation.amount.as_deref().and_then(parse_amount_minor);
        if amount != Some(payment.amount_minor) {
            return Err(PaymentError::ValidationFailed(format!(
                "amount mismatch: expected {}, got {}",
                minor_to_decimal(payment.amount_minor),
                validation.amount.unwrap_or_default()
            )));
        }

        Ok(SettlementOutcome {
            gateway: Gateway::Sslcommerz,
            external_id: val_id.to_string(),
            transaction_id: payment.transaction_id.clone(),
            status: PaymentStatus::Paid,
            gateway_transaction_id: validation.bank_tran_id,
            payload: Some(raw),
        })
    }
}

/// Outcome for a fail or cancel redirect. These carry no validation id, so the
/// ledger key is the transaction plus the reported status.
pub fn unsuccessful_outcome(payment: &Payment, status: PaymentStatus) -> SettlementOutcome {
    SettlementOutcome {
        gateway: Gateway::Sslcommerz,
        external_id: format!("{}:{}", payment.transaction_id, status),
        transaction_id: payment.transaction_id.clone(),
        status,
        gateway_transaction_id: None,
        payload: None,
    }
}
