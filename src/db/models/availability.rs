//! Teacher weekly availability windows.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TeacherAvailability {
    pub id: String,
    pub teacher_id: String,
    /// 0 = Monday ... 6 = Sunday
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
    pub is_active: i32,
    pub break_minutes: i64,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAvailabilityRequest {
    /// Admins may set availability for any teacher
    pub teacher_id: Option<String>,
    pub weekday: i64,
    pub start_time: String,
    pub end_time: String,
    #[serde(default = "default_break_minutes")]
    pub break_minutes: i64,
}

fn default_break_minutes() -> i64 {
    10
}

#[derive(Debug, Deserialize)]
pub struct SlotQuery {
    pub date: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TimeSlot {
    pub start_time: String,
    pub end_time: String,
}
