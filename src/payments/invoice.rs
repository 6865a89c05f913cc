//! Invoices for paid payments.
//!
//! An invoice is issued in the same transaction that marks its payment paid and is
//! never reissued; the downloadable document is rendered on request.

use uuid::Uuid;

use super::{format_amount, PaymentError, Result};
use crate::db::{Invoice, Payment, User};
use crate::DbPool;

const SCHOOL_NAME: &str = "Amar Quran";
const SCHOOL_TAGLINE: &str = "Online Qur'an Learning Platform";

pub(crate) async fn issue<'e, E>(executor: E, payment: &Payment, issued_at: &str) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
{
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO invoices (id, payment_id, invoice_number, user_id, amount_minor, currency, issued_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&payment.id)
    .bind(&payment.invoice_number)
    .bind(&payment.user_id)
    .bind(payment.amount_minor)
    .bind(&payment.currency)
    .bind(issued_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn get_invoice(db: &DbPool, payment_id: &str) -> Result<Invoice> {
    sqlx::query_as::<_, Invoice>("SELECT * FROM invoices WHERE payment_id = ?")
        .bind(payment_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("Invoice"))
}

/// Plain-text invoice document
pub async fn render(db: &DbPool, invoice: &Invoice) -> Result<String> {
    let payment = super::get_payment(db, &invoice.payment_id).await?;
    let (course_title,): (String,) = sqlx::query_as("SELECT title FROM courses WHERE id = ?")
        .bind(&payment.course_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("Course"))?;
    let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&invoice.user_id)
        .fetch_optional(db)
        .await?
        .ok_or(PaymentError::NotFound("User"))?;

    let total = format_amount(invoice.amount_minor, &invoice.currency);
    let mut lines = vec![
        "INVOICE".to_string(),
        SCHOOL_NAME.to_string(),
        SCHOOL_TAGLINE.to_string(),
        String::new(),
        format!("Invoice Number: {}", invoice.invoice_number),
        format!("Issued: {}", invoice.issued_at),
        format!("Billed To: {} <{}>", user.full_name(), user.email),
        format!("Transaction: {}", payment.transaction_id),
        format!("Payment Method: {}", payment.gateway),
    ];
    if let Some(reference) = &payment.gateway_transaction_id {
        lines.push(format!("Gateway Reference: {}", reference));
    }
    lines.extend([
        String::new(),
        format!("{:<40} {:>20}", "Description", "Amount"),
        format!("{:<40} {:>20}", course_title, total),
        format!("{:<40} {:>20}", "Total", total),
        String::new(),
        format!("Status: {}", payment.status),
    ]);
    Ok(lines.join("\n") + "\n")
}
