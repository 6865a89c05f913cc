//! Free assessment / trial class intake.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssessmentStatus {
    Submitted,
    Reviewed,
    Scheduled,
    Enrolled,
    Rejected,
}

impl std::fmt::Display for AssessmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Submitted => write!(f, "submitted"),
            Self::Reviewed => write!(f, "reviewed"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Enrolled => write!(f, "enrolled"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Assessment {
    pub id: String,
    pub full_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub preferred_course_id: Option<String>,
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    pub level: String,
    pub age: Option<i64>,
    pub notes: String,
    pub status: String,
    pub notification_sent: i32,
    pub trial_session_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAssessmentRequest {
    pub full_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub preferred_course_id: Option<String>,
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    #[serde(default = "default_level")]
    pub level: String,
    pub age: Option<i64>,
    #[serde(default)]
    pub notes: String,
}

fn default_level() -> String {
    "beginner".to_string()
}

#[derive(Debug, Deserialize)]
pub struct ScheduleTrialRequest {
    pub teacher_id: String,
    /// Existing student account the trial is booked for
    pub student_id: String,
    pub course_id: Option<String>,
    pub date: Option<String>,
    pub start_time: Option<String>,
    #[serde(default = "default_trial_platform")]
    pub platform: super::Platform,
}

fn default_trial_platform() -> super::Platform {
    super::Platform::Teams
}
