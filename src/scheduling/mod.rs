//! Class session booking and lifecycle.
//!
//! Everything here is local state. Meeting creation and notifications are the
//! caller's follow-up, driven by the session this module returns.

pub mod slots;

use chrono::{
    DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone,
};
use tracing::info;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::validation::{parse_date, parse_time, validate_duration};
use crate::db::{
    self, BookSessionRequest, ClassSession, CompleteSessionRequest, Course, MeetingStatus,
    RescheduleRequest, Role, SessionListQuery, SessionStatus, TeacherAvailability, TimeSlot, User,
};
use crate::meetings::{Attendee, MeetingRequest, MeetingUpdate};
use crate::notifications::{Recipient, SessionNotice};
use crate::DbPool;

use slots::{compute_slots, Window};

#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{field}: {message}")]
    Invalid { field: &'static str, message: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl SchedulingError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }
}

impl From<SchedulingError> for ApiError {
    fn from(err: SchedulingError) -> Self {
        match err {
            SchedulingError::NotFound(what) => ApiError::not_found(format!("{} not found", what)),
            SchedulingError::Invalid { field, message } => ApiError::validation_field(field, message),
            SchedulingError::Conflict(msg) => ApiError::conflict(msg),
            SchedulingError::Forbidden(msg) => ApiError::forbidden(msg),
            SchedulingError::Database(e) => e.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulingError>;

/// Statuses that hold a teacher's time
const BLOCKING_STATUSES: &str = "('scheduled', 'in_progress', 'rescheduled')";

/// A session with the rows needed to talk about it
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session: ClassSession,
    pub course: Course,
    pub teacher: User,
    pub student: User,
}

impl SessionContext {
    pub fn notice(&self, reason: Option<String>) -> SessionNotice {
        SessionNotice {
            session_id: self.session.id.clone(),
            course_title: self.course.title.clone(),
            student: recipient(&self.student),
            teacher: recipient(&self.teacher),
            date: self.session.date.clone(),
            start_time: self.session.start_time.clone(),
            end_time: self.session.end_time.clone(),
            platform: self.session.platform.clone(),
            join_url: self.session.meeting_link.clone().filter(|u| !u.is_empty()),
            reason,
        }
    }

    pub fn subject(&self) -> String {
        format!("{} - {} with {}", self.course.title, self.student.full_name(), self.teacher.full_name())
    }

    fn attendees(&self) -> Vec<Attendee> {
        vec![
            Attendee::new(self.teacher.email.clone(), Some(self.teacher.full_name())),
            Attendee::new(self.student.email.clone(), Some(self.student.full_name())),
        ]
    }

    pub fn meeting_request(&self, offset: FixedOffset) -> Result<MeetingRequest> {
        let (start, end) = session_window(&self.session, offset)?;
        Ok(MeetingRequest {
            subject: self.subject(),
            body: format!(
                "<p>{} class for {}.</p><p>Teacher: {}</p>",
                self.course.title,
                self.student.full_name(),
                self.teacher.full_name()
            ),
            start,
            end,
            attendees: self.attendees(),
            transaction_id: Some(self.session.id.clone()),
        })
    }

    pub fn meeting_update(&self, offset: FixedOffset) -> Result<MeetingUpdate> {
        let (start, end) = session_window(&self.session, offset)?;
        Ok(MeetingUpdate {
            subject: Some(self.subject()),
            start: Some(start),
            end: Some(end),
            attendees: Some(self.attendees()),
        })
    }
}

fn recipient(user: &User) -> Recipient {
    Recipient {
        user_id: Some(user.id.clone()),
        name: user.full_name(),
        email: Some(user.email.clone()),
        phone: user.phone_number.clone(),
    }
}

/// Combine a session's local date and time in the school's UTC offset
pub fn local_instant(date: NaiveDate, time: NaiveTime, offset: FixedOffset) -> Result<DateTime<FixedOffset>> {
    offset
        .from_local_datetime(&NaiveDateTime::new(date, time))
        .single()
        .ok_or_else(|| SchedulingError::invalid("start_time", "time does not exist in the configured offset"))
}

/// Start and end instants of a session
pub fn session_window(
    session: &ClassSession,
    offset: FixedOffset,
) -> Result<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
    let date = parse_date(&session.date).map_err(|e| SchedulingError::invalid("date", e))?;
    let start = parse_time(&session.start_time).map_err(|e| SchedulingError::invalid("start_time", e))?;
    let end = parse_time(&session.end_time).map_err(|e| SchedulingError::invalid("end_time", e))?;
    Ok((local_instant(date, start, offset)?, local_instant(date, end, offset)?))
}

fn format_time(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// End time for a start and duration; classes may not run past midnight
fn end_time(start: NaiveTime, duration_minutes: i64) -> Result<NaiveTime> {
    let (end, wrapped) = start.overflowing_add_signed(chrono::Duration::minutes(duration_minutes));
    if wrapped != 0 || end <= start {
        return Err(SchedulingError::invalid(
            "start_time",
            "session must end on the same day it starts",
        ));
    }
    Ok(end)
}

pub async fn get_session(db: &DbPool, id: &str) -> Result<ClassSession> {
    sqlx::query_as::<_, ClassSession>("SELECT * FROM class_sessions WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?
        .ok_or(SchedulingError::NotFound("Session"))
}

async fn get_user(db: &DbPool, id: &str) -> Result<Option<User>> {
    Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ? AND is_active = 1")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn session_context(db: &DbPool, session: ClassSession) -> Result<SessionContext> {
    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = ?")
        .bind(&session.course_id)
        .fetch_optional(db)
        .await?
        .ok_or(SchedulingError::NotFound("Course"))?;
    let teacher = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&session.teacher_id)
        .fetch_optional(db)
        .await?
        .ok_or(SchedulingError::NotFound("Teacher"))?;
    let student = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&session.student_id)
        .fetch_optional(db)
        .await?
        .ok_or(SchedulingError::NotFound("Student"))?;

    Ok(SessionContext {
        session,
        course,
        teacher,
        student,
    })
}

/// Admins see everything; teachers and students only their own sessions
pub fn ensure_participant(actor: &User, session: &ClassSession) -> Result<()> {
    if actor.is_admin() || actor.id == session.teacher_id || actor.id == session.student_id {
        Ok(())
    } else {
        Err(SchedulingError::Forbidden(
            "You are not a participant of this session".to_string(),
        ))
    }
}

async fn ensure_no_overlap(
    db: &DbPool,
    column: &'static str,
    user_id: &str,
    date: &str,
    start: &str,
    end: &str,
    exclude_id: Option<&str>,
) -> Result<()> {
    let sql = format!(
        "SELECT COUNT(*) FROM class_sessions \
         WHERE {} = ? AND date = ? AND status IN {} \
         AND start_time < ? AND end_time > ? AND id != ?",
        column, BLOCKING_STATUSES
    );
    let overlapping: i64 = sqlx::query_scalar(&sql)
        .bind(user_id)
        .bind(date)
        .bind(end)
        .bind(start)
        .bind(exclude_id.unwrap_or(""))
        .fetch_one(db)
        .await?;

    if overlapping > 0 {
        let who = if column == "teacher_id" { "Teacher" } else { "Student" };
        return Err(SchedulingError::Conflict(format!(
            "{} already has a class between {} and {} on {}",
            who, start, end, date
        )));
    }
    Ok(())
}

/// Book a class. The new session is `scheduled` with its meeting still pending.
pub async fn book_session(db: &DbPool, actor: &User, req: &BookSessionRequest) -> Result<ClassSession> {
    let date = parse_date(&req.date).map_err(|e| SchedulingError::invalid("date", e))?;
    let start = parse_time(&req.start_time).map_err(|e| SchedulingError::invalid("start_time", e))?;

    let course = sqlx::query_as::<_, Course>("SELECT * FROM courses WHERE id = ? AND is_active = 1")
        .bind(&req.course_id)
        .fetch_optional(db)
        .await?
        .ok_or(SchedulingError::NotFound("Course"))?;

    let teacher = get_user(db, &req.teacher_id)
        .await?
        .filter(|u| u.role_enum() == Role::Teacher)
        .ok_or(SchedulingError::NotFound("Teacher"))?;

    let student_id = match actor.role_enum() {
        Role::Student => actor.id.clone(),
        Role::Teacher if actor.id != teacher.id => {
            return Err(SchedulingError::Forbidden(
                "Teachers can only book their own classes".to_string(),
            ))
        }
        Role::Teacher | Role::Admin => req
            .student_id
            .clone()
            .ok_or_else(|| SchedulingError::invalid("student_id", "student_id is required"))?,
    };

    let student = get_user(db, &student_id)
        .await?
        .filter(|u| u.role_enum() == Role::Student)
        .ok_or(SchedulingError::NotFound("Student"))?;

    if !actor.is_admin() {
        let enrolled: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM enrollments WHERE student_id = ? AND course_id = ? AND status = 'active'",
        )
        .bind(&student.id)
        .bind(&course.id)
        .fetch_one(db)
        .await?;
        if enrolled == 0 {
            return Err(SchedulingError::Forbidden(
                "Student is not enrolled in this course".to_string(),
            ));
        }
    }

    let duration = course.session_duration_minutes;
    validate_duration(duration).map_err(|e| SchedulingError::invalid("duration_minutes", e))?;
    let end = end_time(start, duration)?;

    let date_str = date.format("%Y-%m-%d").to_string();
    let start_str = format_time(start);
    let end_str = format_time(end);

    ensure_no_overlap(db, "teacher_id", &teacher.id, &date_str, &start_str, &end_str, None).await?;
    ensure_no_overlap(db, "student_id", &student.id, &date_str, &start_str, &end_str, None).await?;

    let id = Uuid::new_v4().to_string();
    let now = db::timestamp();
    let (teacher_notes, student_notes) = if actor.role_enum() == Role::Student {
        (String::new(), req.notes.clone())
    } else {
        (req.notes.clone(), String::new())
    };

    sqlx::query(
        r#"
        INSERT INTO class_sessions (
            id, course_id, teacher_id, student_id, date, start_time, end_time,
            duration_minutes, platform, status, meeting_status, teacher_notes,
            student_notes, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(&course.id)
    .bind(&teacher.id)
    .bind(&student.id)
    .bind(&date_str)
    .bind(&start_str)
    .bind(&end_str)
    .bind(duration)
    .bind(req.platform.to_string())
    .bind(SessionStatus::Scheduled.to_string())
    .bind(MeetingStatus::Pending.to_string())
    .bind(&teacher_notes)
    .bind(&student_notes)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            SchedulingError::Conflict("Teacher already has a class at this time".to_string())
        } else {
            SchedulingError::Database(e)
        }
    })?;

    info!(
        session_id = %id,
        teacher_id = %teacher.id,
        student_id = %student.id,
        date = %date_str,
        start = %start_str,
        "Class session booked"
    );

    get_session(db, &id).await
}

pub async fn list_sessions(db: &DbPool, actor: &User, query: &SessionListQuery) -> Result<Vec<ClassSession>> {
    let sessions = sqlx::query_as::<_, ClassSession>(
        r#"
        SELECT * FROM class_sessions
        WHERE (? = 1 OR teacher_id = ? OR student_id = ?)
          AND (? IS NULL OR status = ?)
          AND (? IS NULL OR date >= ?)
          AND (? IS NULL OR date <= ?)
        ORDER BY date ASC, start_time ASC
        "#,
    )
    .bind(actor.is_admin() as i32)
    .bind(&actor.id)
    .bind(&actor.id)
    .bind(&query.status)
    .bind(&query.status)
    .bind(&query.from)
    .bind(&query.from)
    .bind(&query.to)
    .bind(&query.to)
    .fetch_all(db)
    .await?;
    Ok(sessions)
}

/// Record the external meeting. Only the first reference sticks, and only while the
/// session is still open; returns false otherwise.
pub async fn attach_meeting(
    db: &DbPool,
    session_id: &str,
    meeting_id: Option<&str>,
    join_url: &str,
    status: MeetingStatus,
) -> Result<bool> {
    let sql = format!(
        r#"
        UPDATE class_sessions
        SET meeting_id = ?, meeting_link = ?, meeting_status = ?, updated_at = ?
        WHERE id = ?
          AND (meeting_id IS NULL OR meeting_id = '')
          AND (meeting_link IS NULL OR meeting_link = '')
          AND status IN {}
        "#,
        BLOCKING_STATUSES
    );
    let result = sqlx::query(&sql)
        .bind(meeting_id)
        .bind(join_url)
        .bind(status.to_string())
        .bind(db::timestamp())
        .bind(session_id)
        .execute(db)
        .await?;

    Ok(result.rows_affected() == 1)
}

pub async fn set_meeting_status(db: &DbPool, session_id: &str, status: MeetingStatus) -> Result<()> {
    sqlx::query("UPDATE class_sessions SET meeting_status = ?, updated_at = ? WHERE id = ?")
        .bind(status.to_string())
        .bind(db::timestamp())
        .bind(session_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Replace a locally generated link (WhatsApp) after the session moved
pub async fn refresh_meeting_link(db: &DbPool, session_id: &str, join_url: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE class_sessions SET meeting_link = ?, updated_at = ?
        WHERE id = ? AND (meeting_id IS NULL OR meeting_id = '')
        "#,
    )
    .bind(join_url)
    .bind(db::timestamp())
    .bind(session_id)
    .execute(db)
    .await?;
    Ok(())
}

fn prepend_note(existing: &str, note: &str) -> String {
    if note.trim().is_empty() {
        existing.to_string()
    } else if existing.is_empty() {
        note.trim().to_string()
    } else {
        format!("{}\n{}", note.trim(), existing)
    }
}

/// Mark a session cancelled. Remote meeting cleanup is the caller's follow-up and
/// never affects this state change.
pub async fn cancel_session(db: &DbPool, actor: &User, id: &str, reason: &str) -> Result<ClassSession> {
    let session = get_session(db, id).await?;
    ensure_participant(actor, &session)?;

    if !session.status_enum().is_open() {
        return Err(SchedulingError::Conflict(format!(
            "Cannot cancel a session that is {}",
            session.status
        )));
    }

    let note = if reason.trim().is_empty() {
        String::new()
    } else {
        format!("Cancelled: {}", reason.trim())
    };
    let column = notes_column(actor, &session);
    let sql = format!(
        "UPDATE class_sessions SET status = ?, {col} = ?, updated_at = ? WHERE id = ?",
        col = column
    );
    let existing = if column == "teacher_notes" { &session.teacher_notes } else { &session.student_notes };

    sqlx::query(&sql)
        .bind(SessionStatus::Cancelled.to_string())
        .bind(prepend_note(existing, &note))
        .bind(db::timestamp())
        .bind(id)
        .execute(db)
        .await?;

    info!(session_id = %id, actor_id = %actor.id, "Class session cancelled");
    get_session(db, id).await
}

fn notes_column(actor: &User, session: &ClassSession) -> &'static str {
    if actor.id == session.student_id {
        "student_notes"
    } else {
        "teacher_notes"
    }
}

/// Move a session to a new date and time; it becomes `scheduled` again
pub async fn reschedule_session(
    db: &DbPool,
    actor: &User,
    id: &str,
    req: &RescheduleRequest,
) -> Result<ClassSession> {
    let session = get_session(db, id).await?;
    ensure_participant(actor, &session)?;

    if !session.status_enum().is_open() {
        return Err(SchedulingError::Conflict(format!(
            "Cannot reschedule a session that is {}",
            session.status
        )));
    }

    let date = parse_date(&req.date).map_err(|e| SchedulingError::invalid("date", e))?;
    let start = parse_time(&req.start_time).map_err(|e| SchedulingError::invalid("start_time", e))?;
    let end = end_time(start, session.duration_minutes)?;

    let date_str = date.format("%Y-%m-%d").to_string();
    let start_str = format_time(start);
    let end_str = format_time(end);

    ensure_no_overlap(db, "teacher_id", &session.teacher_id, &date_str, &start_str, &end_str, Some(id)).await?;
    ensure_no_overlap(db, "student_id", &session.student_id, &date_str, &start_str, &end_str, Some(id)).await?;

    let note = if req.reason.trim().is_empty() {
        format!("Rescheduled from {} {}", session.date, session.start_time)
    } else {
        format!("Rescheduled from {} {}: {}", session.date, session.start_time, req.reason.trim())
    };
    let column = notes_column(actor, &session);
    let existing = if column == "teacher_notes" { &session.teacher_notes } else { &session.student_notes };
    let sql = format!(
        "UPDATE class_sessions SET date = ?, start_time = ?, end_time = ?, status = ?, \
         reminder_sent = 0, {col} = ?, updated_at = ? WHERE id = ?",
        col = column
    );

    sqlx::query(&sql)
        .bind(&date_str)
        .bind(&start_str)
        .bind(&end_str)
        .bind(SessionStatus::Scheduled.to_string())
        .bind(prepend_note(existing, &note))
        .bind(db::timestamp())
        .bind(id)
        .execute(db)
        .await
        .map_err(|e| {
            if db::is_unique_violation(&e) {
                SchedulingError::Conflict("Teacher already has a class at this time".to_string())
            } else {
                SchedulingError::Database(e)
            }
        })?;

    info!(session_id = %id, date = %date_str, start = %start_str, "Class session rescheduled");
    get_session(db, id).await
}

/// Teacher or admin closes a session; absent students make it a no-show
pub async fn complete_session(
    db: &DbPool,
    actor: &User,
    id: &str,
    req: &CompleteSessionRequest,
) -> Result<ClassSession> {
    let session = get_session(db, id).await?;
    if !(actor.is_admin() || actor.id == session.teacher_id) {
        return Err(SchedulingError::Forbidden(
            "Only the session's teacher can complete it".to_string(),
        ));
    }
    if !session.status_enum().is_open() {
        return Err(SchedulingError::Conflict(format!(
            "Cannot complete a session that is {}",
            session.status
        )));
    }

    let status = if req.attended {
        SessionStatus::Completed
    } else {
        SessionStatus::NoShow
    };
    let notes = if req.notes.trim().is_empty() {
        session.teacher_notes.clone()
    } else {
        prepend_note(&session.teacher_notes, &req.notes)
    };

    sqlx::query(
        "UPDATE class_sessions SET status = ?, attended = ?, teacher_notes = ?, updated_at = ? WHERE id = ?",
    )
    .bind(status.to_string())
    .bind(req.attended as i32)
    .bind(&notes)
    .bind(db::timestamp())
    .bind(id)
    .execute(db)
    .await?;

    info!(session_id = %id, status = %status, "Class session closed");
    get_session(db, id).await
}

/// Open 30-minute slots for a teacher on a date
pub async fn available_slots(db: &DbPool, teacher_id: &str, date: &str) -> Result<Vec<TimeSlot>> {
    let date = parse_date(date).map_err(|e| SchedulingError::invalid("date", e))?;
    let weekday = date.weekday().num_days_from_monday() as i64;

    let availability = sqlx::query_as::<_, TeacherAvailability>(
        "SELECT * FROM teacher_availability WHERE teacher_id = ? AND weekday = ? AND is_active = 1",
    )
    .bind(teacher_id)
    .bind(weekday)
    .fetch_all(db)
    .await?;

    let windows: Vec<Window> = availability
        .iter()
        .filter_map(|a| {
            Some(Window {
                start: parse_time(&a.start_time).ok()?,
                end: parse_time(&a.end_time).ok()?,
                break_minutes: a.break_minutes,
            })
        })
        .collect();

    let sql = format!(
        "SELECT start_time, end_time FROM class_sessions WHERE teacher_id = ? AND date = ? AND status IN {}",
        BLOCKING_STATUSES
    );
    let booked_rows: Vec<(String, String)> = sqlx::query_as(&sql)
        .bind(teacher_id)
        .bind(date.format("%Y-%m-%d").to_string())
        .fetch_all(db)
        .await?;

    let booked: Vec<(NaiveTime, NaiveTime)> = booked_rows
        .iter()
        .filter_map(|(s, e)| Some((parse_time(s).ok()?, parse_time(e).ok()?)))
        .collect();

    Ok(compute_slots(&windows, &booked))
}
