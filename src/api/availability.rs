use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{parse_time, validate_weekday};
use crate::db::{self, CreateAvailabilityRequest, Role, SlotQuery, TeacherAvailability, TimeSlot, User};
use crate::scheduling;
use crate::AppState;

/// GET /api/teachers/:id/availability?date=YYYY-MM-DD
pub async fn teacher_slots(
    State(state): State<Arc<AppState>>,
    Path(teacher_id): Path<String>,
    Query(query): Query<SlotQuery>,
) -> Result<Json<Vec<TimeSlot>>, ApiError> {
    Ok(Json(
        scheduling::available_slots(&state.db, &teacher_id, &query.date).await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct AvailabilityListQuery {
    /// Admin only; teachers always see their own windows
    pub teacher_id: Option<String>,
}

/// GET /api/availability
pub async fn list_availability(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Query(query): Query<AvailabilityListQuery>,
) -> Result<Json<Vec<TeacherAvailability>>, ApiError> {
    let teacher_id = match user.role_enum() {
        Role::Admin => query.teacher_id,
        Role::Teacher => Some(user.id.clone()),
        Role::Student => return Err(ApiError::forbidden("Only teachers have availability")),
    };

    let windows = sqlx::query_as::<_, TeacherAvailability>(
        r#"
        SELECT * FROM teacher_availability
        WHERE (? IS NULL OR teacher_id = ?)
        ORDER BY teacher_id, weekday, start_time
        "#,
    )
    .bind(&teacher_id)
    .bind(&teacher_id)
    .fetch_all(&state.db)
    .await?;

    Ok(Json(windows))
}

fn validate_window(req: &CreateAvailabilityRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors.check("weekday", validate_weekday(req.weekday));

    let start = parse_time(&req.start_time);
    let end = parse_time(&req.end_time);
    match (&start, &end) {
        (Ok(start), Ok(end)) if start >= end => {
            errors.add("end_time", "End time must be after start time");
        }
        _ => {}
    }
    if let Err(e) = start {
        errors.add("start_time", e);
    }
    if let Err(e) = end {
        errors.add("end_time", e);
    }
    if !(0..=120).contains(&req.break_minutes) {
        errors.add("break_minutes", "Break must be between 0 and 120 minutes");
    }
    errors.finish()
}

/// POST /api/availability
pub async fn create_availability(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateAvailabilityRequest>,
) -> Result<(StatusCode, Json<TeacherAvailability>), ApiError> {
    let teacher_id = match (user.role_enum(), &req.teacher_id) {
        (Role::Teacher, None) => user.id.clone(),
        (Role::Teacher, Some(id)) if *id == user.id => user.id.clone(),
        (Role::Admin, Some(id)) => id.clone(),
        (Role::Admin, None) => return Err(ApiError::validation_field("teacher_id", "teacher_id is required")),
        _ => return Err(ApiError::forbidden("You can only manage your own availability")),
    };
    validate_window(&req)?;

    let is_teacher: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM users WHERE id = ? AND role = 'teacher' AND is_active = 1")
            .bind(&teacher_id)
            .fetch_optional(&state.db)
            .await?;
    if is_teacher.is_none() {
        return Err(ApiError::not_found("Teacher not found"));
    }

    let id = Uuid::new_v4().to_string();
    let start = parse_time(&req.start_time).map_err(|e| ApiError::validation_field("start_time", e))?;
    let end = parse_time(&req.end_time).map_err(|e| ApiError::validation_field("end_time", e))?;
    sqlx::query(
        r#"
        INSERT INTO teacher_availability (id, teacher_id, weekday, start_time, end_time, is_active, break_minutes, created_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&teacher_id)
    .bind(req.weekday)
    .bind(start.format("%H:%M").to_string())
    .bind(end.format("%H:%M").to_string())
    .bind(req.break_minutes)
    .bind(db::timestamp())
    .execute(&state.db)
    .await?;

    let window = sqlx::query_as::<_, TeacherAvailability>("SELECT * FROM teacher_availability WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;

    tracing::info!(teacher_id = %teacher_id, weekday = req.weekday, "Availability window added");
    Ok((StatusCode::CREATED, Json(window)))
}

/// DELETE /api/availability/:id
pub async fn delete_availability(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let window = sqlx::query_as::<_, TeacherAvailability>("SELECT * FROM teacher_availability WHERE id = ?")
        .bind(&id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("Availability window not found"))?;

    if !user.is_admin() && window.teacher_id != user.id {
        return Err(ApiError::forbidden("You can only manage your own availability"));
    }

    sqlx::query("DELETE FROM teacher_availability WHERE id = ?")
        .bind(&id)
        .execute(&state.db)
        .await?;

    Ok(StatusCode::NO_CONTENT)
}
