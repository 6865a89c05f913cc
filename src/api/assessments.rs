//! Free assessment intake and trial class scheduling.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::auth::require_admin;
use super::error::{ApiError, ValidationErrorBuilder};
use super::sessions::enqueue_meeting_job;
use super::validation::{parse_date, parse_time, validate_age, validate_email, validate_phone};
use crate::db::{
    self, Assessment, AssessmentStatus, BookSessionRequest, ClassSession, CreateAssessmentRequest,
    ScheduleTrialRequest, User,
};
use crate::engine::MeetingJob;
use crate::notifications::{AssessmentNotice, NotificationEvent, NotificationService};
use crate::scheduling;
use crate::{AppState, DbPool};

fn validate_assessment(req: &CreateAssessmentRequest) -> Result<(), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if req.full_name.trim().is_empty() {
        errors.add("full_name", "Full name is required");
    }
    errors.check("phone_number", validate_phone(req.phone_number.trim()));
    if let Some(email) = req.email.as_deref().map(str::trim).filter(|e| !e.is_empty()) {
        errors.check("email", validate_email(email));
    }
    if let Some(date) = &req.preferred_date {
        errors.check("preferred_date", parse_date(date).map(|_| ()));
    }
    if let Some(time) = &req.preferred_time {
        errors.check("preferred_time", parse_time(time).map(|_| ()));
    }
    errors.check("age", validate_age(req.age));
    errors.finish()
}

/// Tell the admin about a new submission and remember that we did
async fn announce(db: &DbPool, notifier: &NotificationService, assessment: &Assessment) {
    let preferred_course = match &assessment.preferred_course_id {
        Some(id) => sqlx::query_scalar::<_, String>("SELECT title FROM courses WHERE id = ?")
            .bind(id)
            .fetch_optional(db)
            .await
            .ok()
            .flatten(),
        None => None,
    };

    let notice = AssessmentNotice {
        assessment_id: assessment.id.clone(),
        full_name: assessment.full_name.clone(),
        phone_number: assessment.phone_number.clone(),
        email: assessment.email.clone(),
        preferred_course,
        preferred_date: assessment.preferred_date.clone(),
        preferred_time: assessment.preferred_time.clone(),
        notes: assessment.notes.clone(),
    };
    let summary = notifier
        .dispatch(&NotificationEvent::AssessmentSubmitted(notice))
        .await;

    if summary.delivered > 0 {
        if let Err(e) = sqlx::query("UPDATE assessments SET notification_sent = 1, updated_at = ? WHERE id = ?")
            .bind(db::timestamp())
            .bind(&assessment.id)
            .execute(db)
            .await
        {
            tracing::warn!(assessment_id = %assessment.id, error = %e, "Failed to flag assessment notification");
        }
    }
}

async fn get_assessment(db: &DbPool, id: &str) -> Result<Assessment, ApiError> {
    sqlx::query_as::<_, Assessment>("SELECT * FROM assessments WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or_else(|| ApiError::not_found("Assessment not found"))
}

/// POST /api/assessments (public)
pub async fn create_assessment(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateAssessmentRequest>,
) -> Result<(StatusCode, Json<Assessment>), ApiError> {
    validate_assessment(&req)?;

    let id = Uuid::new_v4().to_string();
    let now = db::timestamp();
    sqlx::query(
        r#"
        INSERT INTO assessments (
            id, full_name, phone_number, email, preferred_course_id, preferred_date, preferred_time,
            level, age, notes, status, notification_sent, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(req.full_name.trim())
    .bind(req.phone_number.trim())
    .bind(req.email.as_deref().map(str::trim).filter(|e| !e.is_empty()).map(str::to_lowercase))
    .bind(req.preferred_course_id.as_deref().filter(|c| !c.is_empty()))
    .bind(&req.preferred_date)
    .bind(&req.preferred_time)
    .bind(&req.level)
    .bind(req.age)
    .bind(&req.notes)
    .bind(AssessmentStatus::Submitted.to_string())
    .bind(&now)
    .bind(&now)
    .execute(&state.db)
    .await?;

    let assessment = get_assessment(&state.db, &id).await?;
    tracing::info!(assessment_id = %assessment.id, "Assessment submitted");

    let db = state.db.clone();
    let notifier = Arc::clone(&state.notifier);
    let submitted = assessment.clone();
    tokio::spawn(async move { announce(&db, &notifier, &submitted).await });

    Ok((StatusCode::CREATED, Json(assessment)))
}

#[derive(Debug, Default, Deserialize)]
pub struct AssessmentListQuery {
    pub status: Option<String>,
}

/// GET /api/assessments (admin)
pub async fn list_assessments(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Query(query): Query<AssessmentListQuery>,
) -> Result<Json<Vec<Assessment>>, ApiError> {
    require_admin(&user)?;
    let assessments = sqlx::query_as::<_, Assessment>(
        "SELECT * FROM assessments WHERE (? IS NULL OR status = ?) ORDER BY created_at DESC",
    )
    .bind(&query.status)
    .bind(&query.status)
    .fetch_all(&state.db)
    .await?;
    Ok(Json(assessments))
}

/// POST /api/assessments/:id/schedule-trial (admin)
///
/// Books a trial class for the assessment, defaulting to the preferred course,
/// date and time given on the form.
pub async fn schedule_trial(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Json(req): Json<ScheduleTrialRequest>,
) -> Result<(StatusCode, Json<ClassSession>), ApiError> {
    require_admin(&user)?;
    let assessment = get_assessment(&state.db, &id).await?;
    if assessment.trial_session_id.is_some() {
        return Err(ApiError::conflict("A trial class is already scheduled for this assessment"));
    }

    let mut errors = ValidationErrorBuilder::new();
    let course_id = req.course_id.clone().or(assessment.preferred_course_id.clone());
    let date = req.date.clone().or(assessment.preferred_date.clone());
    let start_time = req.start_time.clone().or(assessment.preferred_time.clone());
    if course_id.is_none() {
        errors.add("course_id", "No course given and none preferred on the assessment");
    }
    if date.is_none() {
        errors.add("date", "No date given and none preferred on the assessment");
    }
    if start_time.is_none() {
        errors.add("start_time", "No start time given and none preferred on the assessment");
    }
    errors.finish()?;

    let booking = BookSessionRequest {
        course_id: course_id.unwrap_or_default(),
        teacher_id: req.teacher_id.clone(),
        student_id: Some(req.student_id.clone()),
        date: date.unwrap_or_default(),
        start_time: start_time.unwrap_or_default(),
        platform: req.platform,
        notes: format!("Trial class for assessment {}", assessment.id),
    };
    let session = scheduling::book_session(&state.db, &user, &booking).await?;

    sqlx::query("UPDATE assessments SET status = ?, trial_session_id = ?, updated_at = ? WHERE id = ?")
        .bind(AssessmentStatus::Scheduled.to_string())
        .bind(&session.id)
        .bind(db::timestamp())
        .bind(&assessment.id)
        .execute(&state.db)
        .await?;

    enqueue_meeting_job(
        &state,
        MeetingJob::Create {
            session_id: session.id.clone(),
        },
    )
    .await;
    match scheduling::session_context(&state.db, session.clone()).await {
        Ok(ctx) => {
            state
                .notifier
                .notify(NotificationEvent::SessionBooked(ctx.notice(None)));
        }
        Err(e) => tracing::warn!(session_id = %session.id, error = %e, "Cannot build session notification"),
    }

    tracing::info!(assessment_id = %assessment.id, session_id = %session.id, "Trial class scheduled");
    Ok((StatusCode::CREATED, Json(session)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifications::testing::RecordingChannel;
    use crate::notifications::{ChannelKind, Recipient};

    fn request() -> CreateAssessmentRequest {
        CreateAssessmentRequest {
            full_name: "Aisha Rahman".into(),
            phone_number: "+8801712345678".into(),
            email: Some("aisha@example.com".into()),
            preferred_course_id: None,
            preferred_date: Some("2026-03-02".into()),
            preferred_time: Some("10:00".into()),
            level: "beginner".into(),
            age: Some(9),
            notes: String::new(),
        }
    }

    #[test]
    fn test_assessment_validation() {
        assert!(validate_assessment(&request()).is_ok());

        let mut req = request();
        req.phone_number = "12345".into();
        req.age = Some(2);
        req.preferred_time = Some("morning".into());
        assert!(validate_assessment(&req).is_err());

        let mut req = request();
        req.full_name = " ".into();
        assert!(validate_assessment(&req).is_err());
    }

    async fn insert(db: &DbPool) -> Assessment {
        let now = db::timestamp();
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO assessments (id, full_name, phone_number, notes, created_at, updated_at) VALUES (?, 'Aisha', '+8801712345678', '', ?, ?)",
        )
        .bind(&id)
        .bind(&now)
        .bind(&now)
        .execute(db)
        .await
        .unwrap();
        get_assessment(db, &id).await.unwrap()
    }

    #[tokio::test]
    async fn test_announce_flags_delivered_notification() {
        let db = crate::db::init_memory().await.unwrap();
        let assessment = insert(&db).await;
        let email = RecordingChannel::new(ChannelKind::Email);
        let admin = Recipient {
            user_id: None,
            name: "Admin".into(),
            email: Some("admin@example.com".into()),
            phone: None,
        };
        let notifier = NotificationService::new(db.clone(), admin).with_channel(email.clone());

        announce(&db, &notifier, &assessment).await;

        assert_eq!(email.recipients(), vec!["admin@example.com".to_string()]);
        assert_eq!(get_assessment(&db, &assessment.id).await.unwrap().notification_sent, 1);
    }

    #[tokio::test]
    async fn test_announce_without_delivery_leaves_flag_clear() {
        let db = crate::db::init_memory().await.unwrap();
        let assessment = insert(&db).await;
        let email = RecordingChannel::failing(ChannelKind::Email);
        let admin = Recipient {
            user_id: None,
            name: "Admin".into(),
            email: Some("admin@example.com".into()),
            phone: None,
        };
        let notifier = NotificationService::new(db.clone(), admin).with_channel(email);

        announce(&db, &notifier, &assessment).await;

        assert_eq!(get_assessment(&db, &assessment.id).await.unwrap().notification_sent, 0);
    }
}
