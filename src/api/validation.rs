//! Input validation for API requests and outbound meeting requests.
//!
//! Each helper returns `Err(message)`; collect them into an `ApiError` with
//! `ValidationErrorBuilder::check`.

use chrono::{NaiveDate, NaiveTime};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Pragmatic address check: one @, no whitespace, dotted domain
    static ref EMAIL_REGEX: Regex = Regex::new(
        r"^[A-Za-z0-9._%+'-]+@[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?(\.[A-Za-z0-9]([A-Za-z0-9-]*[A-Za-z0-9])?)+$"
    ).unwrap();

    /// Phone numbers as accepted at signup: optional +, optional 1, 9-15 digits
    static ref PHONE_REGEX: Regex = Regex::new(r"^\+?1?\d{9,15}$").unwrap();
}

pub fn is_valid_email(email: &str) -> bool {
    email.len() <= 254 && EMAIL_REGEX.is_match(email)
}

pub fn validate_email(email: &str) -> Result<(), String> {
    if email.is_empty() {
        return Err("Email is required".to_string());
    }
    if !is_valid_email(email) {
        return Err(format!("Invalid email address: {}", email));
    }
    Ok(())
}

pub fn validate_phone(phone: &str) -> Result<(), String> {
    if !PHONE_REGEX.is_match(phone) {
        return Err(
            "Phone number must be entered in the format '+999999999' (9 to 15 digits)".to_string(),
        );
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<(), String> {
    if password.len() < 8 {
        return Err("Password must be at least 8 characters".to_string());
    }
    if password.len() > 128 {
        return Err("Password is too long (max 128 characters)".to_string());
    }
    Ok(())
}

/// Parse a YYYY-MM-DD date
pub fn parse_date(date: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| format!("Invalid date '{}', expected YYYY-MM-DD", date))
}

/// Parse an HH:MM (or HH:MM:SS) time
pub fn parse_time(time: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(time, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(time, "%H:%M:%S"))
        .map_err(|_| format!("Invalid time '{}', expected HH:MM", time))
}

pub fn validate_duration(minutes: i64) -> Result<(), String> {
    if !(15..=180).contains(&minutes) {
        return Err("Session duration must be between 15 and 180 minutes".to_string());
    }
    Ok(())
}

pub fn validate_age(age: Option<i64>) -> Result<(), String> {
    match age {
        Some(a) if !(3..=100).contains(&a) => Err("Age must be between 3 and 100".to_string()),
        _ => Ok(()),
    }
}

pub fn validate_weekday(weekday: i64) -> Result<(), String> {
    if !(0..=6).contains(&weekday) {
        return Err("Weekday must be between 0 (Monday) and 6 (Sunday)".to_string());
    }
    Ok(())
}

/// Validate a UUID format
pub fn validate_uuid(id: &str, field_name: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{} is required", field_name));
    }
    if uuid::Uuid::parse_str(id).is_err() {
        return Err(format!("Invalid {} format", field_name));
    }
    Ok(())
}
