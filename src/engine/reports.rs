//! Weekly activity report emailed to the admin.

use anyhow::Result;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info};

use crate::notifications::{NotificationEvent, NotificationService, ReportNotice};
use crate::payments::minor_to_decimal;
use crate::DbPool;

/// Local time the report goes out on Mondays
const SEND_AT_HOUR: u32 = 8;

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    transaction_id: String,
    email: String,
    amount_minor: i64,
    currency: String,
    status: String,
    created_at: String,
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// CSV covering the 7 days ending on `end_date`, inclusive
pub async fn weekly_report(db: &DbPool, end_date: NaiveDate) -> Result<ReportNotice> {
    let start_date = end_date - ChronoDuration::days(6);
    let start = start_date.format("%Y-%m-%d").to_string();
    let end = end_date.format("%Y-%m-%d").to_string();

    let payments = sqlx::query_as::<_, PaymentRow>(
        r#"
        SELECT p.transaction_id, u.email, p.amount_minor, p.currency, p.status, p.created_at
        FROM payments p JOIN users u ON u.id = p.user_id
        WHERE substr(p.created_at, 1, 10) BETWEEN ? AND ?
        ORDER BY p.created_at
        "#,
    )
    .bind(&start)
    .bind(&end)
    .fetch_all(db)
    .await?;

    let session_counts: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM class_sessions WHERE date BETWEEN ? AND ? GROUP BY status",
    )
    .bind(&start)
    .bind(&end)
    .fetch_all(db)
    .await?;
    let count = |status: &str| -> i64 {
        session_counts
            .iter()
            .find(|(s, _)| s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };
    let total_sessions: i64 = session_counts.iter().map(|(_, n)| n).sum();

    let mut revenue: BTreeMap<&str, i64> = BTreeMap::new();
    let mut csv = String::from("Transaction ID,User,Amount,Currency,Status,Date\n");
    for p in &payments {
        if p.status == "paid" {
            *revenue.entry(p.currency.as_str()).or_insert(0) += p.amount_minor;
        }
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            csv_field(&p.transaction_id),
            csv_field(&p.email),
            minor_to_decimal(p.amount_minor),
            csv_field(&p.currency),
            csv_field(&p.status),
            p.created_at.get(..10).unwrap_or(&p.created_at)
        ));
    }

    csv.push('\n');
    if revenue.is_empty() {
        csv.push_str("Total Revenue,0.00\n");
    }
    for (currency, minor) in &revenue {
        csv.push_str(&format!("Total Revenue ({}),{}\n", currency, minor_to_decimal(*minor)));
    }
    csv.push_str(&format!("Total Transactions,{}\n", payments.len()));
    csv.push_str(&format!("Total Classes,{}\n", total_sessions));
    csv.push_str(&format!("Completed Classes,{}\n", count("completed")));
    csv.push_str(&format!("Cancelled Classes,{}\n", count("cancelled")));
    csv.push_str(&format!("No Show,{}\n", count("no_show")));

    Ok(ReportNotice {
        start_date: start,
        end_date: end,
        csv,
    })
}

/// Next Monday at the send hour strictly after `now`
pub fn next_run_after(now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let days_ahead = (7 - now.weekday().num_days_from_monday()) % 7;
    let send_at = NaiveTime::from_hms_opt(SEND_AT_HOUR, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut date = now.date_naive() + ChronoDuration::days(days_ahead as i64);
    loop {
        if let Some(candidate) = now.timezone().from_local_datetime(&date.and_time(send_at)).single() {
            if candidate > now {
                return candidate;
            }
        }
        date += ChronoDuration::days(7);
    }
}

/// Spawn the weekly report task
pub fn spawn_weekly_report_task(db: DbPool, notifier: Arc<NotificationService>, offset: FixedOffset) {
    info!("Starting weekly report task");

    tokio::spawn(async move {
        loop {
            let now = Utc::now().with_timezone(&offset);
            let next = next_run_after(now);
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next_run = %next, "Weekly report scheduled");
            tokio::time::sleep(wait).await;

            let end_date = (next - ChronoDuration::days(1)).date_naive();
            match weekly_report(&db, end_date).await {
                Ok(report) => {
                    let summary = notifier.dispatch(&NotificationEvent::WeeklyReport(report)).await;
                    info!(delivered = summary.delivered, failed = summary.failed, "Weekly report sent");
                }
                Err(e) => error!(error = %e, "Weekly report failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Gateway, Role};
    use crate::payments::tests::pending_payment;
    use crate::test_support::create_user;

    #[test]
    fn test_csv_field_escaping() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_next_run_is_monday_morning() {
        let tz = FixedOffset::east_opt(6 * 3600).unwrap();
        // Wednesday
        let wed = tz.with_ymd_and_hms(2026, 3, 4, 15, 0, 0).unwrap();
        assert_eq!(next_run_after(wed), tz.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap());
        // Monday before and after the send hour
        let mon_early = tz.with_ymd_and_hms(2026, 3, 9, 7, 0, 0).unwrap();
        assert_eq!(next_run_after(mon_early), tz.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap());
        let mon_late = tz.with_ymd_and_hms(2026, 3, 9, 8, 0, 0).unwrap();
        assert_eq!(next_run_after(mon_late), tz.with_ymd_and_hms(2026, 3, 16, 8, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_weekly_report_totals() {
        let db = crate::db::init_memory().await.unwrap();
        let paid = pending_payment(&db, Gateway::Stripe).await;
        let _pending = pending_payment(&db, Gateway::Sslcommerz).await;
        sqlx::query("UPDATE payments SET status = 'paid' WHERE id = ?")
            .bind(&paid.id)
            .execute(&db)
            .await
            .unwrap();
        let old = pending_payment(&db, Gateway::Stripe).await;
        sqlx::query("UPDATE payments SET status = 'paid', created_at = '2020-01-01T00:00:00Z' WHERE id = ?")
            .bind(&old.id)
            .execute(&db)
            .await
            .unwrap();
        create_user(&db, Role::Student, "extra@example.com", None).await;

        let today = Utc::now().date_naive();
        let report = weekly_report(&db, today).await.unwrap();

        assert_eq!(report.end_date, today.format("%Y-%m-%d").to_string());
        assert!(report.csv.starts_with("Transaction ID,User,Amount,Currency,Status,Date\n"));
        assert!(report.csv.contains(&paid.transaction_id));
        assert!(!report.csv.contains(&old.transaction_id));
        assert!(report.csv.contains("Total Revenue (BDT),1500.00\n"));
        assert!(report.csv.contains("Total Transactions,2\n"));
        assert!(report.csv.contains("Total Classes,0\n"));
    }
}
