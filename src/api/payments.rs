use axum::{
    extract::{Path, State},
    http::header,
    response::IntoResponse,
    Extension, Json,
};
use std::sync::Arc;

use super::auth::require_admin;
use super::error::ApiError;
use crate::db::{CheckoutRequest, CheckoutResponse, Payment, User};
use crate::payments::{self, invoice};
use crate::AppState;

/// POST /api/payments/checkout
pub async fn checkout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let response = payments::start_checkout(
        &state.db,
        &state.payments,
        &user,
        &req.course_id,
        req.gateway,
        &state.config.server.public_url,
    )
    .await?;
    Ok(Json(response))
}

/// GET /api/payments - own payments, or all of them for admins
pub async fn list_payments(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
) -> Result<Json<Vec<Payment>>, ApiError> {
    let payments = sqlx::query_as::<_, Payment>(
        "SELECT * FROM payments WHERE (? = 1 OR user_id = ?) ORDER BY created_at DESC",
    )
    .bind(user.is_admin() as i32)
    .bind(&user.id)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(payments))
}

/// GET /api/payments/:id/invoice - the payer or an admin
pub async fn download_invoice(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let payment = payments::get_payment(&state.db, &id).await?;
    // Someone else's payment looks like a missing one
    if !user.is_admin() && payment.user_id != user.id {
        return Err(ApiError::not_found("Payment not found"));
    }

    let invoice = invoice::get_invoice(&state.db, &payment.id).await?;
    let document = invoice::render(&state.db, &invoice).await?;
    let disposition = format!("attachment; filename=\"invoice_{}.txt\"", invoice.invoice_number);

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        document,
    ))
}

/// POST /api/payments/:id/refund (admin)
///
/// Records a refund issued from the gateway dashboard; no money moves here.
pub async fn refund_payment(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<Payment>, ApiError> {
    require_admin(&user)?;
    let payment = payments::mark_refunded(&state.db, &id).await?;
    tracing::info!(payment_id = %payment.id, admin_id = %user.id, "Payment marked refunded");
    Ok(Json(payment))
}
