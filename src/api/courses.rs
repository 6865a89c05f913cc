use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::auth::require_admin;
use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::validate_duration;
use crate::db::{self, slugify, CheckoutResponse, Course, CreateCourseRequest, Gateway, User};
use crate::payments;
use crate::AppState;

/// GET /api/courses
pub async fn list_courses(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Course>>, ApiError> {
    let courses = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE is_active = 1 ORDER BY title")
        .fetch_all(&state.db)
        .await?;
    Ok(Json(courses))
}

/// GET /api/courses/:id, by id or slug
pub async fn get_course(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Course>, ApiError> {
    let course = sqlx::query_as::<_, Course>(
        "SELECT * FROM courses WHERE (slug = ? OR id = ?) AND is_active = 1",
    )
    .bind(&key)
    .bind(&key)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("Course not found"))?;
    Ok(Json(course))
}

fn validate_course(req: &CreateCourseRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if req.title.trim().is_empty() {
        errors.add("title", "Title is required");
    } else if slugify(&req.title).is_empty() {
        errors.add("title", "Title must contain letters or digits");
    }
    errors.check("session_duration_minutes", validate_duration(req.session_duration_minutes));
    if req.price_minor.is_some_and(|p| p < 0) {
        errors.add("price_minor", "Price cannot be negative");
    }
    match (req.discount_price_minor, req.price_minor) {
        (Some(d), _) if d < 0 => {
            errors.add("discount_price_minor", "Discount price cannot be negative");
        }
        (Some(d), Some(p)) if d > p => {
            errors.add("discount_price_minor", "Discount price cannot exceed the price");
        }
        _ => {}
    }
    if req.currency.len() != 3 || !req.currency.chars().all(|c| c.is_ascii_alphabetic()) {
        errors.add("currency", "Currency must be a 3-letter code");
    }
    errors.finish()
}

/// POST /api/courses (admin)
pub async fn create_course(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<CreateCourseRequest>,
) -> Result<(StatusCode, Json<Course>), ApiError> {
    require_admin(&user)?;
    validate_course(&req)?;

    let id = Uuid::new_v4().to_string();
    let now = db::timestamp();
    sqlx::query(
        r#"
        INSERT INTO courses (
            id, title, slug, course_type, description, price_minor, discount_price_minor,
            currency, session_duration_minutes, is_active, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(req.title.trim())
    .bind(slugify(&req.title))
    .bind(&req.course_type)
    .bind(&req.description)
    .bind(req.price_minor)
    .bind(req.discount_price_minor)
    .bind(req.currency.to_uppercase())
    .bind(req.session_duration_minutes)
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            ApiError::conflict("A course with this title already exists")
        } else {
            e.into()
        }
    })?;

    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = ?")
        .bind(&id)
        .fetch_one(&state.db)
        .await?;

    tracing::info!(course_id = %course.id, slug = %course.slug, "Course created");
    Ok((StatusCode::CREATED, Json(course)))
}

#[derive(Debug, Default, Deserialize)]
pub struct EnrollRequest {
    pub gateway: Option<Gateway>,
}

/// POST /api/courses/:id/enroll
///
/// Free courses enroll right away; paid ones answer with the gateway redirect.
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(course_id): Path<String>,
    body: Option<Json<EnrollRequest>>,
) -> Result<Json<CheckoutResponse>, ApiError> {
    let gateway = body
        .and_then(|Json(req)| req.gateway)
        .unwrap_or(Gateway::Sslcommerz);

    let response = payments::start_checkout(
        &state.db,
        &state.payments,
        &user,
        &course_id,
        gateway,
        &state.config.server.public_url,
    )
    .await?;
    Ok(Json(response))
}
