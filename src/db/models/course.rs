//! Course catalog and enrollment models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Course {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub course_type: String,
    pub description: String,
    /// Price in minor currency units (paisa, cents). None or 0 means free.
    pub price_minor: Option<i64>,
    pub discount_price_minor: Option<i64>,
    pub currency: String,
    pub session_duration_minutes: i64,
    pub is_active: i32,
    pub created_at: String,
    pub updated_at: String,
}

impl Course {
    /// Discount price when set, otherwise the list price, otherwise zero
    pub fn current_price(&self) -> i64 {
        self.discount_price_minor
            .or(self.price_minor)
            .unwrap_or(0)
            .max(0)
    }

    pub fn is_free(&self) -> bool {
        self.current_price() == 0
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateCourseRequest {
    pub title: String,
    #[serde(default = "default_course_type")]
    pub course_type: String,
    #[serde(default)]
    pub description: String,
    pub price_minor: Option<i64>,
    pub discount_price_minor: Option<i64>,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_session_duration")]
    pub session_duration_minutes: i64,
}

fn default_course_type() -> String {
    "quran".to_string()
}

pub fn default_currency() -> String {
    "BDT".to_string()
}

fn default_session_duration() -> i64 {
    30
}

/// URL slug derived from a course title
pub fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    slug.trim_end_matches('-').to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Pending,
    Active,
    Completed,
    Cancelled,
}

impl std::fmt::Display for EnrollmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Enrollment {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn course(price: Option<i64>, discount: Option<i64>) -> Course {
        Course {
            id: "c1".into(),
            title: "Tajweed".into(),
            slug: "tajweed".into(),
            course_type: "quran".into(),
            description: String::new(),
            price_minor: price,
            discount_price_minor: discount,
            currency: "BDT".into(),
            session_duration_minutes: 30,
            is_active: 1,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    #[test]
    fn test_current_price_prefers_discount() {
        assert_eq!(course(Some(150_000), Some(120_000)).current_price(), 120_000);
        assert_eq!(course(Some(150_000), None).current_price(), 150_000);
        assert!(course(None, None).is_free());
        assert!(course(Some(0), None).is_free());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Noorani Qaida (Beginners)"), "noorani-qaida-beginners");
        assert_eq!(slugify("  Arabic 101  "), "arabic-101");
    }
}
