//! Class session (booking) models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Teams,
    Zoom,
    GoogleMeet,
    Whatsapp,
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Teams => write!(f, "teams"),
            Self::Zoom => write!(f, "zoom"),
            Self::GoogleMeet => write!(f, "google_meet"),
            Self::Whatsapp => write!(f, "whatsapp"),
        }
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "teams" => Ok(Self::Teams),
            "zoom" => Ok(Self::Zoom),
            "google_meet" => Ok(Self::GoogleMeet),
            "whatsapp" => Ok(Self::Whatsapp),
            _ => Err(format!("Unknown platform: {}", s)),
        }
    }
}

impl From<String> for Platform {
    fn from(s: String) -> Self {
        s.parse().unwrap_or(Self::Teams)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Rescheduled,
    NoShow,
}

impl SessionStatus {
    /// Statuses from which a session may still be cancelled or rescheduled
    pub fn is_open(&self) -> bool {
        matches!(
            self,
            Self::Scheduled | Self::Rescheduled | Self::InProgress
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Rescheduled => write!(f, "rescheduled"),
            Self::NoShow => write!(f, "no_show"),
        }
    }
}

impl From<String> for SessionStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "scheduled" => Self::Scheduled,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            "rescheduled" => Self::Rescheduled,
            "no_show" => Self::NoShow,
            _ => Self::Scheduled,
        }
    }
}

/// Whether the external meeting for a session exists yet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Pending,
    Created,
    Failed,
    NotRequired,
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Created => write!(f, "created"),
            Self::Failed => write!(f, "failed"),
            Self::NotRequired => write!(f, "not_required"),
        }
    }
}

impl From<String> for MeetingStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "created" => Self::Created,
            "failed" => Self::Failed,
            "not_required" => Self::NotRequired,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClassSession {
    pub id: String,
    pub course_id: String,
    pub teacher_id: String,
    pub student_id: String,
    /// YYYY-MM-DD in the school's local time
    pub date: String,
    /// HH:MM in the school's local time
    pub start_time: String,
    pub end_time: String,
    pub duration_minutes: i64,
    pub platform: String,
    pub status: String,
    pub meeting_id: Option<String>,
    pub meeting_link: Option<String>,
    pub meeting_status: String,
    pub teacher_notes: String,
    pub student_notes: String,
    pub attended: i32,
    pub reminder_sent: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl ClassSession {
    pub fn status_enum(&self) -> SessionStatus {
        SessionStatus::from(self.status.clone())
    }

    pub fn platform_enum(&self) -> Platform {
        Platform::from(self.platform.clone())
    }

    pub fn meeting_status_enum(&self) -> MeetingStatus {
        MeetingStatus::from(self.meeting_status.clone())
    }

    pub fn has_meeting(&self) -> bool {
        self.meeting_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct BookSessionRequest {
    pub course_id: String,
    pub teacher_id: String,
    /// Required when an admin books on behalf of a student
    pub student_id: Option<String>,
    pub date: String,
    pub start_time: String,
    #[serde(default = "default_platform")]
    pub platform: Platform,
    #[serde(default)]
    pub notes: String,
}

fn default_platform() -> Platform {
    Platform::Teams
}

#[derive(Debug, Deserialize)]
pub struct RescheduleRequest {
    pub date: String,
    pub start_time: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelSessionRequest {
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CompleteSessionRequest {
    #[serde(default = "default_attended")]
    pub attended: bool,
    #[serde(default)]
    pub notes: String,
}

fn default_attended() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionListQuery {
    pub status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}
