//! Notification audit log.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NotificationLogEntry {
    pub id: i64,
    pub event: String,
    pub channel: String,
    pub recipient: String,
    pub success: i32,
    pub error: Option<String>,
    pub created_at: String,
}

/// Opt-outs per channel and kind of message. Users without a row get everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct NotificationPreferences {
    pub user_id: String,
    pub email_class_reminder: i32,
    pub email_class_updates: i32,
    pub email_payment_receipt: i32,
    pub whatsapp_class_reminder: i32,
    pub whatsapp_class_updates: i32,
    pub whatsapp_payment_receipt: i32,
    pub reminder_minutes_before: Option<i64>,
    pub updated_at: String,
}

impl NotificationPreferences {
    pub fn defaults(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            email_class_reminder: 1,
            email_class_updates: 1,
            email_payment_receipt: 1,
            whatsapp_class_reminder: 1,
            whatsapp_class_updates: 1,
            whatsapp_payment_receipt: 1,
            reminder_minutes_before: None,
            updated_at: String::new(),
        }
    }
}

/// Partial update; absent fields keep their value
#[derive(Debug, Default, Deserialize)]
pub struct UpdatePreferencesRequest {
    pub email_class_reminder: Option<bool>,
    pub email_class_updates: Option<bool>,
    pub email_payment_receipt: Option<bool>,
    pub whatsapp_class_reminder: Option<bool>,
    pub whatsapp_class_updates: Option<bool>,
    pub whatsapp_payment_receipt: Option<bool>,
    pub reminder_minutes_before: Option<i64>,
}
