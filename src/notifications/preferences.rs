//! Per-user opt-outs and reminder lead time.

use std::ops::RangeInclusive;

use super::ChannelKind;
use crate::db::{self, NotificationPreferences, UpdatePreferencesRequest};
use crate::DbPool;

/// Accepted `reminder_minutes_before`; 0 clears it back to the school default
pub const REMINDER_MINUTES: RangeInclusive<i64> = 5..=1440;

/// What a message is about, as far as opting out goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCategory {
    ClassReminder,
    /// Booked, rescheduled, cancelled, meeting link ready
    ClassUpdates,
    PaymentReceipt,
}

impl NotificationPreferences {
    pub fn allows(&self, category: MessageCategory, kind: ChannelKind) -> bool {
        let flag = match (kind, category) {
            (ChannelKind::Email, MessageCategory::ClassReminder) => self.email_class_reminder,
            (ChannelKind::Email, MessageCategory::ClassUpdates) => self.email_class_updates,
            (ChannelKind::Email, MessageCategory::PaymentReceipt) => self.email_payment_receipt,
            (ChannelKind::WhatsApp, MessageCategory::ClassReminder) => self.whatsapp_class_reminder,
            (ChannelKind::WhatsApp, MessageCategory::ClassUpdates) => self.whatsapp_class_updates,
            (ChannelKind::WhatsApp, MessageCategory::PaymentReceipt) => self.whatsapp_payment_receipt,
        };
        flag != 0
    }
}

pub async fn load(db: &DbPool, user_id: &str) -> Result<NotificationPreferences, sqlx::Error> {
    let stored = sqlx::query_as::<_, NotificationPreferences>(
        "SELECT * FROM notification_preferences WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(db)
    .await?;
    Ok(stored.unwrap_or_else(|| NotificationPreferences::defaults(user_id)))
}

/// Merge `req` into the stored preferences. The lead time must already be validated.
pub async fn update(
    db: &DbPool,
    user_id: &str,
    req: &UpdatePreferencesRequest,
) -> Result<NotificationPreferences, sqlx::Error> {
    let mut prefs = load(db, user_id).await?;

    let flags = [
        (&mut prefs.email_class_reminder, req.email_class_reminder),
        (&mut prefs.email_class_updates, req.email_class_updates),
        (&mut prefs.email_payment_receipt, req.email_payment_receipt),
        (&mut prefs.whatsapp_class_reminder, req.whatsapp_class_reminder),
        (&mut prefs.whatsapp_class_updates, req.whatsapp_class_updates),
        (&mut prefs.whatsapp_payment_receipt, req.whatsapp_payment_receipt),
    ];
    for (field, value) in flags {
        if let Some(value) = value {
            *field = value as i32;
        }
    }
    match req.reminder_minutes_before {
        Some(0) => prefs.reminder_minutes_before = None,
        Some(minutes) => prefs.reminder_minutes_before = Some(minutes),
        None => {}
    }

    sqlx::query(
        r#"
        INSERT INTO notification_preferences (
            user_id, email_class_reminder, email_class_updates, email_payment_receipt,
            whatsapp_class_reminder, whatsapp_class_updates, whatsapp_payment_receipt,
            reminder_minutes_before, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            email_class_reminder = excluded.email_class_reminder,
            email_class_updates = excluded.email_class_updates,
            email_payment_receipt = excluded.email_payment_receipt,
            whatsapp_class_reminder = excluded.whatsapp_class_reminder,
            whatsapp_class_updates = excluded.whatsapp_class_updates,
            whatsapp_payment_receipt = excluded.whatsapp_payment_receipt,
            reminder_minutes_before = excluded.reminder_minutes_before,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(user_id)
    .bind(prefs.email_class_reminder)
    .bind(prefs.email_class_updates)
    .bind(prefs.email_payment_receipt)
    .bind(prefs.whatsapp_class_reminder)
    .bind(prefs.whatsapp_class_updates)
    .bind(prefs.whatsapp_payment_receipt)
    .bind(prefs.reminder_minutes_before)
    .bind(db::timestamp())
    .execute(db)
    .await?;

    load(db, user_id).await
}

/// Longest lead time anyone asked for, if any
pub async fn longest_reminder_lead(db: &DbPool) -> Result<Option<i64>, sqlx::Error> {
    sqlx::query_scalar("SELECT MAX(reminder_minutes_before) FROM notification_preferences")
        .fetch_one(db)
        .await
}
