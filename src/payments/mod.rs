//! Course payments: checkout, gateway settlement and the idempotent ledger.
//!
//! Gateways report outcomes more than once (webhook retries, SSLCommerz IPN plus the
//! browser redirect). [`apply_outcome`] records each `(gateway, external id)` in
//! `processed_webhooks` in the same transaction as the status change, so a payment
//! transitions once no matter how many deliveries arrive.

pub mod invoice;
pub mod sslcommerz;
pub mod stripe;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::config::PaymentsConfig;
use crate::db::{
    self, CheckoutResponse, Course, EnrollmentStatus, Gateway, Payment, PaymentStatus, User,
};
use crate::notifications::{PaymentNotice, Recipient};
use crate::DbPool;

pub use sslcommerz::SslCommerzGateway;
pub use stripe::{verify_stripe_signature, StripeGateway};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("payment gateway {0} is not configured")]
    GatewayNotConfigured(Gateway),

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("invalid gateway payload: {0}")]
    InvalidPayload(String),

    #[error("payment validation failed: {0}")]
    ValidationFailed(String),

    #[error("gateway request failed: {0}")]
    Gateway(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::NotFound(what) => ApiError::not_found(format!("{} not found", what)),
            PaymentError::GatewayNotConfigured(_) => ApiError::service_unavailable(err.to_string()),
            PaymentError::InvalidSignature => ApiError::unauthorized(err.to_string()),
            PaymentError::InvalidPayload(_) | PaymentError::ValidationFailed(_) => {
                ApiError::bad_request(err.to_string())
            }
            PaymentError::Gateway(_) => ApiError::external(err.to_string()),
            PaymentError::Conflict(msg) => ApiError::conflict(msg),
            PaymentError::Database(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

/// A verified gateway report about one of our transactions
#[derive(Debug, Clone)]
pub struct SettlementOutcome {
    pub gateway: Gateway,
    /// Deduplication key: Stripe event id, SSLCommerz validation id
    pub external_id: String,
    /// Our `payments.transaction_id`
    pub transaction_id: String,
    pub status: PaymentStatus,
    pub gateway_transaction_id: Option<String>,
    pub payload: Option<String>,
}

#[derive(Debug)]
pub enum ApplyResult {
    /// First delivery; the payment changed status
    Applied(Payment),
    /// Already seen, or the payment was past the point this outcome could change
    Duplicate,
}

/// Configured gateways
#[derive(Default)]
pub struct PaymentGateways {
    pub stripe: Option<StripeGateway>,
    pub sslcommerz: Option<SslCommerzGateway>,
}

impl PaymentGateways {
    pub fn from_config(config: &PaymentsConfig) -> Self {
        let stripe = config.stripe.clone().map(StripeGateway::new);
        let sslcommerz = config.sslcommerz.clone().map(SslCommerzGateway::new);
        if stripe.is_some() {
            info!("Stripe payments enabled");
        }
        if sslcommerz.is_some() {
            info!("SSLCommerz payments enabled");
        }
        Self { stripe, sslcommerz }
    }

    fn is_configured(&self, gateway: Gateway) -> bool {
        match gateway {
            Gateway::Stripe => self.stripe.is_some(),
            Gateway::Sslcommerz => self.sslcommerz.is_some(),
        }
    }
}

/// "1500.00" for 150000 minor units
pub fn minor_to_decimal(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

pub fn format_amount(minor: i64, currency: &str) -> String {
    format!("{} {}", minor_to_decimal(minor), currency)
}

/// Parse a gateway decimal amount ("1500", "1500.5", "1500.00") into minor units
pub fn parse_amount_minor(amount: &str) -> Option<i64> {
    let amount = amount.trim();
    let (whole, frac) = match amount.split_once('.') {
        Some((w, f)) => (w, f),
        None => (amount, ""),
    };
    if whole.is_empty() || !whole.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if frac.len() > 2 && frac[2..].chars().any(|c| c != '0') {
        return None;
    }
    let frac: String = frac.chars().take(2).collect();
    if !frac.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let cents = match frac.len() {
        0 => 0,
        1 => frac.parse::<i64>().ok()? * 10,
        _ => frac.parse::<i64>().ok()?,
    };
    whole.parse::<i64>().ok()?.checked_mul(100)?.checked_add(cents)
}

fn invoice_number(user_id: &str) -> String {
    let suffix: String = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("INV{}{}", Utc::now().format("%Y%m%d%H%M%S"), suffix)
}

async fn activate_enrollment<'e, E>(executor: E, student_id: &str, course_id: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    let now = db::timestamp();
    sqlx::query(
        r#"
        INSERT INTO enrollments (id, student_id, course_id, status, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT (student_id, course_id) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(student_id)
    .bind(course_id)
    .bind(EnrollmentStatus::Active.to_string())
    .bind(&now)
    .bind(&now)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_payment(db: &DbPool, id: &str) -> Result<Payment> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("Payment"))
}

pub async fn get_payment_by_transaction(db: &DbPool, transaction_id: &str) -> Result<Payment> {
    sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE transaction_id = ?")
        .bind(transaction_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("Payment"))
}

/// Start paying for a course. Free courses enroll immediately; paid ones get a
/// pending payment row and a gateway redirect.
pub async fn start_checkout(
    db: &DbPool,
    gateways: &PaymentGateways,
    user: &User,
    course_id: &str,
    gateway: Gateway,
    public_url: &str,
) -> Result<CheckoutResponse> {
    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = ? AND is_active = 1")
        .bind(course_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("Course"))?;

    let enrolled: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM enrollments WHERE student_id = ? AND course_id = ? AND status = 'active'",
    )
    .bind(&user.id)
    .bind(&course.id)
    .fetch_one(db)
    .await?;
    if enrolled > 0 {
        return Err(PaymentError::Conflict("Already enrolled in this course".to_string()));
    }

    if course.is_free() {
        activate_enrollment(db, &user.id, &course.id).await?;
        info!(user_id = %user.id, course_id = %course.id, "Enrolled in free course");
        return Ok(CheckoutResponse {
            payment_id: None,
            redirect_url: None,
            enrolled: true,
        });
    }

    if !gateways.is_configured(gateway) {
        return Err(PaymentError::GatewayNotConfigured(gateway));
    }

    let payment_id = Uuid::new_v4().to_string();
    let transaction_id = Uuid::new_v4().simple().to_string();
    let now = db::timestamp();

    sqlx::query(
        r#"
        INSERT INTO payments (
            id, transaction_id, user_id, course_id, amount_minor, currency, gateway,
            status, invoice_number, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?)
        "#,
    )
    .bind(&payment_id)
    .bind(&transaction_id)
    .bind(&user.id)
    .bind(&course.id)
    .bind(course.current_price())
    .bind(&course.currency)
    .bind(gateway.to_string())
    .bind(invoice_number(&user.id))
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await?;

    let payment = get_payment(db, &payment_id).await?;
    let public_url = public_url.trim_end_matches('/');

    let session = match gateway {
        Gateway::Stripe => match &gateways.stripe {
            Some(stripe) => stripe.create_checkout_session(&payment, &course, user, public_url).await,
            None => Err(PaymentError::GatewayNotConfigured(gateway)),
        },
        Gateway::Sslcommerz => match &gateways.sslcommerz {
            Some(ssl) => ssl.init_session(&payment, &course, user, public_url).await,
            None => Err(PaymentError::GatewayNotConfigured(gateway)),
        },
    };

    let session = match session {
        Ok(session) => session,
        Err(e) => {
            warn!(payment_id = %payment.id, gateway = %gateway, error = %e, "Checkout session failed");
            sqlx::query("UPDATE payments SET status = 'failed', updated_at = ? WHERE id = ? AND status = 'pending'")
                .bind(db::timestamp())
                .bind(&payment.id)
                .execute(db)
                .await?;
            return Err(e);
        }
    };

    sqlx::query("UPDATE payments SET gateway_transaction_id = ?, updated_at = ? WHERE id = ?")
        .bind(&session.session_id)
        .bind(db::timestamp())
        .bind(&payment.id)
        .execute(db)
        .await?;

    info!(
        payment_id = %payment.id,
        gateway = %gateway,
        amount = %format_amount(payment.amount_minor, &payment.currency),
        "Checkout started"
    );

    Ok(CheckoutResponse {
        payment_id: Some(payment.id),
        redirect_url: Some(session.redirect_url),
        enrolled: false,
    })
}

/// A gateway-hosted payment page
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub session_id: String,
    pub redirect_url: String,
}

/// Apply a gateway outcome exactly once
pub async fn apply_outcome(db: &DbPool, outcome: &SettlementOutcome) -> Result<ApplyResult> {
    let allowed_from: &[&str] = match outcome.status {
        PaymentStatus::Paid => &["pending", "failed"],
        PaymentStatus::Failed | PaymentStatus::Cancelled => &["pending"],
        PaymentStatus::Pending | PaymentStatus::Refunded => {
            return Err(PaymentError::InvalidPayload(format!(
                "gateways cannot report {}",
                outcome.status
            )))
        }
    };

    let mut tx = db.begin().await?;

    let payment = sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE transaction_id = ?")
        .bind(&outcome.transaction_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(PaymentError::NotFound("Payment"))?;

    if payment.gateway != outcome.gateway.to_string() {
        return Err(PaymentError::InvalidPayload(format!(
            "transaction {} belongs to {}",
            payment.transaction_id, payment.gateway
        )));
    }

    let recorded = sqlx::query(
        r#"
        INSERT OR IGNORE INTO processed_webhooks (gateway, external_id, transaction_id, outcome, received_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(outcome.gateway.to_string())
    .bind(&outcome.external_id)
    .bind(&outcome.transaction_id)
    .bind(outcome.status.to_string())
    .bind(db::timestamp())
    .execute(&mut *tx)
    .await?;

    if recorded.rows_affected() == 0 {
        info!(
            gateway = %outcome.gateway,
            external_id = %outcome.external_id,
            "Duplicate gateway delivery ignored"
        );
        return Ok(ApplyResult::Duplicate);
    }

    let now = db::timestamp();
    let paid_at = (outcome.status == PaymentStatus::Paid).then(|| now.clone());
    let sql = format!(
        r#"
        UPDATE payments
        SET status = ?,
            gateway_transaction_id = COALESCE(?, gateway_transaction_id),
            gateway_payload = COALESCE(?, gateway_payload),
            paid_at = COALESCE(?, paid_at),
            updated_at = ?
        WHERE id = ? AND status IN ({})
        "#,
        allowed_from
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let updated = sqlx::query(&sql)
        .bind(outcome.status.to_string())
        .bind(&outcome.gateway_transaction_id)
        .bind(&outcome.payload)
        .bind(&paid_at)
        .bind(&now)
        .bind(&payment.id)
        .execute(&mut *tx)
        .await?;

    if updated.rows_affected() == 0 {
        tx.commit().await?;
        info!(
            payment_id = %payment.id,
            current = %payment.status,
            reported = %outcome.status,
            "Gateway outcome does not change payment"
        );
        return Ok(ApplyResult::Duplicate);
    }

    if outcome.status == PaymentStatus::Paid {
        activate_enrollment(&mut *tx, &payment.user_id, &payment.course_id).await?;
        invoice::issue(&mut *tx, &payment, &now).await?;
    }

    tx.commit().await?;

    metrics::counter!(
        "payments_total",
        "gateway" => outcome.gateway.to_string(),
        "status" => outcome.status.to_string()
    )
    .increment(1);

    info!(
        payment_id = %payment.id,
        gateway = %outcome.gateway,
        status = %outcome.status,
        "Payment updated from gateway"
    );

    Ok(ApplyResult::Applied(get_payment(db, &payment.id).await?))
}

/// Admin marks a paid payment refunded; the enrollment is cancelled with it
pub async fn mark_refunded(db: &DbPool, payment_id: &str) -> Result<Payment> {
    let payment = get_payment(db, payment_id).await?;
    if payment.status_enum() != PaymentStatus::Paid {
        return Err(PaymentError::Conflict(format!(
            "Only paid payments can be refunded (status is {})",
            payment.status
        )));
    }

    let mut tx = db.begin().await?;
    let now = db::timestamp();
    let updated = sqlx::query(
        "UPDATE payments SET status = 'refunded', updated_at = ? WHERE id = ? AND status = 'paid'",
    )
    .bind(&now)
    .bind(payment_id)
    .execute(&mut *tx)
    .await?;
    if updated.rows_affected() == 0 {
        return Err(PaymentError::Conflict("Payment changed concurrently".to_string()));
    }

    sqlx::query(
        "UPDATE enrollments SET status = ?, updated_at = ? WHERE student_id = ? AND course_id = ?",
    )
    .bind(EnrollmentStatus::Cancelled.to_string())
    .bind(&now)
    .bind(&payment.user_id)
    .bind(&payment.course_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    info!(payment_id = %payment_id, "Payment marked refunded");
    get_payment(db, payment_id).await
}

/// Notification context for a payment
pub async fn payment_notice(db: &DbPool, payment: &Payment) -> Result<PaymentNotice> {
    let (course_title,): (String,) = sqlx::query_as("SELECT title FROM courses WHERE id = ?")
        .bind(&payment.course_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("Course"))?;
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&payment.user_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("User"))?;

    Ok(PaymentNotice {
        payment_id: payment.id.clone(),
        invoice_number: payment.invoice_number.clone(),
        course_title,
        amount: format_amount(payment.amount_minor, &payment.currency),
        gateway: payment.gateway.clone(),
        payer: Recipient {
            user_id: Some(user.id.clone()),
            name: user.full_name(),
            email: Some(user.email.clone()),
            phone: user.phone_number.clone(),
        },
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::Role;
    use crate::test_support::{create_course, create_user};

    /// A pending Stripe payment for a fresh student and paid course
    pub async fn pending_payment(db: &DbPool, gateway: Gateway) -> Payment {
        let student = create_user(db, Role::Student, &format!("{}@example.com", Uuid::new_v4().simple()), None).await;
        let course = create_course(db, &format!("Course {}", Uuid::new_v4().simple()), Some(150_000), 30).await;
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO payments (id, transaction_id, user_id, course_id, amount_minor, currency, gateway, status, invoice_number, created_at, updated_at)
            VALUES (?, ?, ?, ?, 150000, 'BDT', ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(format!("txn-{}", Uuid::new_v4().simple()))
        .bind(&student.id)
        .bind(&course.id)
        .bind(gateway.to_string())
        .bind(format!("INV-{}", id))
        .bind(db::timestamp())
        .bind(db::timestamp())
        .execute(db)
        .await
        .unwrap();
        get_payment(db, &id).await.unwrap()
    }

    fn outcome(payment: &Payment, external_id: &str, status: PaymentStatus) -> SettlementOutcome {
        SettlementOutcome {
            gateway: Gateway::Stripe,
            external_id: external_id.into(),
            transaction_id: payment.transaction_id.clone(),
            status,
            gateway_transaction_id: Some("pi_123".into()),
            payload: Some("{}".into()),
        }
    }

    #[test]
    fn test_amount_formatting() {
        assert_eq!(minor_to_decimal(150_000), "1500.00");
        assert_eq!(minor_to_decimal(5), "0.05");
        assert_eq!(format_amount(99_950, "BDT"), "999.50 BDT");
    }

    #[test]
    fn test_parse_amount_minor() {
        assert_eq!(parse_amount_minor("1500.00"), Some(150_000));
        assert_eq!(parse_amount_minor("1500"), Some(150_000));
        assert_eq!(parse_amount_minor("1500.5"), Some(150_050));
        assert_eq!(parse_amount_minor("1500.5000"), Some(150_050));
        assert_eq!(parse_amount_minor("1500.505"), None);
        assert_eq!(parse_amount_minor("abc"), None);
        assert_eq!(parse_amount_minor("-5"), None);
    }

    #[test]
    fn test_invoice_number_shape() {
        let inv = invoice_number("3f2a9c1e-0000");
        assert!(inv.starts_with("INV"));
        assert!(inv.ends_with("3F2A9C"));
        assert_eq!(inv.len(), 3 + 14 + 6);
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let db = crate::db::init_memory().await.unwrap();
        let payment = pending_payment(&db, Gateway::Stripe).await;
        let paid = outcome(&payment, "evt_1", PaymentStatus::Paid);

        let first = apply_outcome(&db, &paid).await.unwrap();
        let second = apply_outcome(&db, &paid).await.unwrap();

        match first {
            ApplyResult::Applied(p) => {
                assert_eq!(p.status_enum(), PaymentStatus::Paid);
                assert!(p.paid_at.is_some());
            }
            ApplyResult::Duplicate => panic!("first delivery must apply"),
        }
        assert!(matches!(second, ApplyResult::Duplicate));

        let enrollment: crate::db::Enrollment = sqlx::query_as(
            "SELECT * FROM enrollments WHERE student_id = ? AND course_id = ?",
        )
        .bind(&payment.user_id)
        .bind(&payment.course_id)
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(enrollment.status, EnrollmentStatus::Active.to_string());

        let ledger: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_webhooks")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(ledger.0, 1);
    }

    #[tokio::test]
    async fn test_late_failure_does_not_undo_paid() {
        let db = crate::db::init_memory().await.unwrap();
        let payment = pending_payment(&db, Gateway::Stripe).await;

        apply_outcome(&db, &outcome(&payment, "evt_1", PaymentStatus::Paid))
            .await
            .unwrap();
        let late = apply_outcome(&db, &outcome(&payment, "evt_2", PaymentStatus::Failed))
            .await
            .unwrap();

        assert!(matches!(late, ApplyResult::Duplicate));
        let payment = get_payment(&db, &payment.id).await.unwrap();
        assert_eq!(payment.status_enum(), PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_unknown_transaction_leaves_no_ledger_row() {
        let db = crate::db::init_memory().await.unwrap();
        let payment = pending_payment(&db, Gateway::Stripe).await;
        let mut stray = outcome(&payment, "evt_x", PaymentStatus::Paid);
        stray.transaction_id = "nope".into();

        assert!(matches!(
            apply_outcome(&db, &stray).await,
            Err(PaymentError::NotFound("Payment"))
        ));
        let ledger: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM processed_webhooks")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(ledger.0, 0);
    }

    #[tokio::test]
    async fn test_refund_only_from_paid() {
        let db = crate::db::init_memory().await.unwrap();
        let payment = pending_payment(&db, Gateway::Stripe).await;

        assert!(matches!(
            mark_refunded(&db, &payment.id).await,
            Err(PaymentError::Conflict(_))
        ));

        apply_outcome(&db, &outcome(&payment, "evt_1", PaymentStatus::Paid))
            .await
            .unwrap();
        let refunded = mark_refunded(&db, &payment.id).await.unwrap();
        assert_eq!(refunded.status_enum(), PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_free_course_checkout_enrolls() {
        let db = crate::db::init_memory().await.unwrap();
        let student = create_user(&db, Role::Student, "free@example.com", None).await;
        let course = create_course(&db, "Intro Circle", None, 30).await;

        let response = start_checkout(
            &db,
            &PaymentGateways::default(),
            &student,
            &course.id,
            Gateway::Stripe,
            "http://localhost:8000",
        )
        .await
        .unwrap();
        assert!(response.enrolled);
        assert!(response.payment_id.is_none());

        let again = start_checkout(
            &db,
            &PaymentGateways::default(),
            &student,
            &course.id,
            Gateway::Stripe,
            "http://localhost:8000",
        )
        .await;
        assert!(matches!(again, Err(PaymentError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_paid_course_needs_configured_gateway() {
        let db = crate::db::init_memory().await.unwrap();
        let student = create_user(&db, Role::Student, "buyer@example.com", None).await;
        let course = create_course(&db, "Hifz Program", Some(500_000), 60).await;

        let result = start_checkout(
            &db,
            &PaymentGateways::default(),
            &student,
            &course.id,
            Gateway::Sslcommerz,
            "http://localhost:8000",
        )
        .await;
        assert!(matches!(result, Err(PaymentError::GatewayNotConfigured(Gateway::Sslcommerz))));

        let rows: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM payments")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(rows.0, 0);
    }
}
