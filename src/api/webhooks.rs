//! Payment gateway callbacks.
//!
//! Every path funnels into `payments::apply_outcome`, so a redelivered event or a
//! browser redirect racing the IPN changes the payment at most once, and only the
//! delivery that changed it sends a notification.

use axum::{
    body::Bytes,
    extract::{Form, State},
    http::HeaderMap,
    response::Redirect,
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::{Gateway, Payment, PaymentStatus};
use crate::notifications::NotificationEvent;
use crate::payments::sslcommerz::{unsuccessful_outcome, CallbackForm};
use crate::payments::{self, stripe, ApplyResult, PaymentError, SettlementOutcome};
use crate::AppState;

/// Apply an outcome and notify the payer when it changed the payment
async fn settle(state: &AppState, outcome: &SettlementOutcome) -> Result<ApplyResult, PaymentError> {
    let result = payments::apply_outcome(&state.db, outcome).await?;

    match &result {
        ApplyResult::Applied(payment) => {
            tracing::info!(
                payment_id = %payment.id,
                gateway = %outcome.gateway,
                status = %payment.status,
                "Payment settled"
            );
            notify_payer(state, payment).await;
        }
        ApplyResult::Duplicate => {
            tracing::debug!(
                gateway = %outcome.gateway,
                external_id = %outcome.external_id,
                "Duplicate gateway delivery ignored"
            );
        }
    }
    Ok(result)
}

async fn notify_payer(state: &AppState, payment: &Payment) {
    let status = payment.status_enum();
    if !matches!(status, PaymentStatus::Paid | PaymentStatus::Failed) {
        return;
    }
    match payments::payment_notice(&state.db, payment).await {
        Ok(notice) => {
            let event = if status == PaymentStatus::Paid {
                NotificationEvent::PaymentPaid(notice)
            } else {
                NotificationEvent::PaymentFailed(notice)
            };
            state.notifier.notify(event);
        }
        Err(e) => tracing::warn!(payment_id = %payment.id, error = %e, "Cannot build payment notification"),
    }
}

fn ack(result: &ApplyResult) -> Json<Value> {
    let status = match result {
        ApplyResult::Applied(_) => "applied",
        ApplyResult::Duplicate => "duplicate",
    };
    Json(json!({ "received": true, "status": status }))
}

/// POST /webhooks/stripe
pub async fn stripe_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let gateway = state
        .payments
        .stripe
        .as_ref()
        .ok_or(PaymentError::GatewayNotConfigured(Gateway::Stripe))?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            PaymentError::InvalidSignature
        })?;
    stripe::verify_stripe_signature(
        gateway.webhook_secret(),
        signature,
        &body,
        chrono::Utc::now().timestamp(),
        gateway.signature_tolerance(),
    )?;

    let Some(outcome) = stripe::parse_event(&body)? else {
        return Ok(Json(json!({ "received": true, "status": "ignored" })));
    };

    match settle(&state, &outcome).await {
        Ok(result) => Ok(ack(&result)),
        // Not one of ours; acknowledge so Stripe stops retrying
        Err(PaymentError::NotFound(_)) => {
            tracing::warn!(transaction_id = %outcome.transaction_id, "Stripe event for unknown transaction");
            Ok(Json(json!({ "received": true, "status": "ignored" })))
        }
        Err(e) => Err(e.into()),
    }
}

async fn callback_payment(state: &AppState, form: &CallbackForm) -> Result<Payment, PaymentError> {
    if let Some(tran_id) = form.tran_id.as_deref().filter(|t| !t.is_empty()) {
        return payments::get_payment_by_transaction(&state.db, tran_id).await;
    }
    match form.value_a.as_deref().filter(|v| !v.is_empty()) {
        Some(payment_id) => payments::get_payment(&state.db, payment_id).await,
        None => Err(PaymentError::InvalidPayload("callback has no tran_id".into())),
    }
}

async fn validate_and_settle(state: &AppState, form: &CallbackForm) -> Result<(Payment, ApplyResult), PaymentError> {
    let gateway = state
        .payments
        .sslcommerz
        .as_ref()
        .ok_or(PaymentError::GatewayNotConfigured(Gateway::Sslcommerz))?;
    let payment = callback_payment(state, form).await?;
    let outcome = gateway.validate(form, &payment).await?;
    let result = settle(state, &outcome).await?;
    Ok((payment, result))
}

fn result_page(state: &AppState, page: &str, payment_id: &str) -> Redirect {
    Redirect::to(&format!(
        "{}/payments/{}?payment_id={}",
        state.config.server.public_url.trim_end_matches('/'),
        page,
        payment_id
    ))
}

/// POST /webhooks/sslcommerz/ipn
pub async fn sslcommerz_ipn(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Json<Value>, ApiError> {
    let (_, result) = validate_and_settle(&state, &form).await?;
    Ok(ack(&result))
}

/// POST /webhooks/sslcommerz/success - the payer's browser returning from the gateway
pub async fn sslcommerz_success(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Redirect, ApiError> {
    let payment = callback_payment(&state, &form).await?;
    match validate_and_settle(&state, &form).await {
        Ok(_) => Ok(result_page(&state, "success", &payment.id)),
        Err(e) => {
            tracing::warn!(payment_id = %payment.id, error = %e, "SSLCommerz success callback rejected");
            Ok(result_page(&state, "failed", &payment.id))
        }
    }
}

async fn unsuccessful(state: &AppState, form: &CallbackForm, status: PaymentStatus) -> Result<Payment, ApiError> {
    let payment = callback_payment(state, form).await?;
    if payment.gateway != Gateway::Sslcommerz.to_string() {
        return Err(PaymentError::InvalidPayload("payment was not made through SSLCommerz".into()).into());
    }
    settle(state, &unsuccessful_outcome(&payment, status)).await?;
    Ok(payment)
}

/// POST /webhooks/sslcommerz/fail
pub async fn sslcommerz_fail(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Redirect, ApiError> {
    let payment = unsuccessful(&state, &form, PaymentStatus::Failed).await?;
    Ok(result_page(&state, "failed", &payment.id))
}

/// POST /webhooks/sslcommerz/cancel
pub async fn sslcommerz_cancel(
    State(state): State<Arc<AppState>>,
    Form(form): Form<CallbackForm>,
) -> Result<Redirect, ApiError> {
    let payment = unsuccessful(&state, &form, PaymentStatus::Cancelled).await?;
    Ok(result_page(&state, "cancel", &payment.id))
}
