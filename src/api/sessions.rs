//! Class session endpoints. Provider calls never run on the request path: handlers
//! persist the change, queue a meeting job and return.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use std::sync::Arc;

use super::error::ApiError;
use crate::db::{
    BookSessionRequest, CancelSessionRequest, ClassSession, CompleteSessionRequest, MeetingStatus,
    RescheduleRequest, SessionListQuery, User,
};
use crate::engine::MeetingJob;
use crate::notifications::NotificationEvent;
use crate::scheduling::{self, SessionContext};
use crate::AppState;

/// Queue a meeting job. A closed channel only means the worker is gone; the
/// session row is already saved and the retry endpoint can queue it again.
pub(crate) async fn enqueue_meeting_job(state: &AppState, job: MeetingJob) {
    let session_id = job.session_id().to_string();
    if let Err(e) = state.meeting_tx.send(job).await {
        tracing::error!(session_id = %session_id, error = %e, "Failed to queue meeting job");
    }
}

async fn notify<F>(state: &AppState, session: ClassSession, build: F)
where
    F: FnOnce(SessionContext) -> NotificationEvent,
{
    let session_id = session.id.clone();
    match scheduling::session_context(&state.db, session).await {
        Ok(ctx) => {
            state.notifier.notify(build(ctx));
        }
        Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Cannot build session notification"),
    }
}

/// GET /api/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<Vec<ClassSession>>, ApiError> {
    Ok(Json(scheduling::list_sessions(&state.db, &user, &query).await?))
}

/// GET /api/sessions/:id
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<Json<ClassSession>, ApiError> {
    let session = scheduling::get_session(&state.db, &id).await?;
    scheduling::ensure_participant(&user, &session)?;
    Ok(Json(session))
}

/// POST /api/sessions
pub async fn book_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Json(req): Json<BookSessionRequest>,
) -> Result<(StatusCode, Json<ClassSession>), ApiError> {
    let session = scheduling::book_session(&state.db, &user, &req).await?;

    enqueue_meeting_job(
        &state,
        MeetingJob::Create {
            session_id: session.id.clone(),
        },
    )
    .await;
    notify(&state, session.clone(), |ctx| {
        NotificationEvent::SessionBooked(ctx.notice(None))
    })
    .await;

    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /api/sessions/:id/cancel
pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    body: Option<Json<CancelSessionRequest>>,
) -> Result<Json<ClassSession>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let reason = if req.reason.trim().is_empty() {
        "Cancelled".to_string()
    } else {
        req.reason.trim().to_string()
    };

    let session = scheduling::cancel_session(&state.db, &user, &id, &reason).await?;

    if let Some(meeting_id) = session.meeting_id.clone().filter(|m| !m.is_empty()) {
        enqueue_meeting_job(
            &state,
            MeetingJob::Cancel {
                session_id: session.id.clone(),
                platform: session.platform_enum(),
                meeting_id,
                reason: reason.clone(),
            },
        )
        .await;
    }

    notify(&state, session.clone(), |ctx| {
        NotificationEvent::SessionCancelled(ctx.notice(Some(reason)))
    })
    .await;

    Ok(Json(session))
}

/// POST /api/sessions/:id/reschedule
pub async fn reschedule_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> Result<Json<ClassSession>, ApiError> {
    let session = scheduling::reschedule_session(&state.db, &user, &id, &req).await?;

    enqueue_meeting_job(
        &state,
        MeetingJob::Update {
            session_id: session.id.clone(),
        },
    )
    .await;

    let reason = Some(req.reason.trim().to_string()).filter(|r| !r.is_empty());
    notify(&state, session.clone(), |ctx| {
        NotificationEvent::SessionRescheduled(ctx.notice(reason))
    })
    .await;

    Ok(Json(session))
}

/// POST /api/sessions/:id/complete
pub async fn complete_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
    body: Option<Json<CompleteSessionRequest>>,
) -> Result<Json<ClassSession>, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    Ok(Json(scheduling::complete_session(&state.db, &user, &id, &req).await?))
}

/// POST /api/sessions/:id/meeting
///
/// Retry the meeting sync for a session whose earlier attempt failed. A session
/// with a meeting whose last update failed gets the update replayed.
pub async fn retry_meeting(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<ClassSession>), ApiError> {
    let session = scheduling::get_session(&state.db, &id).await?;
    scheduling::ensure_participant(&user, &session)?;

    if !session.status_enum().is_open() {
        return Err(ApiError::conflict(format!(
            "Cannot create a meeting for a session that is {}",
            session.status
        )));
    }
    let job = if !session.has_meeting() {
        MeetingJob::Create {
            session_id: session.id.clone(),
        }
    } else if session.meeting_status_enum() == MeetingStatus::Failed {
        MeetingJob::Update {
            session_id: session.id.clone(),
        }
    } else {
        return Err(ApiError::conflict("Session already has a meeting"));
    };

    scheduling::set_meeting_status(&state.db, &session.id, MeetingStatus::Pending).await?;
    enqueue_meeting_job(&state, job).await;

    let session = scheduling::get_session(&state.db, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(session)))
}
