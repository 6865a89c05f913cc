//! Class reminders shortly before a session starts.

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, Utc};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{debug, error, info, warn};

use crate::config::NotificationsConfig;
use crate::db::ClassSession;
use crate::notifications::{preferences, NotificationEvent, NotificationService};
use crate::scheduling;
use crate::DbPool;

pub struct ReminderTask {
    db: DbPool,
    notifier: Arc<NotificationService>,
    offset: FixedOffset,
    lead: ChronoDuration,
}

impl ReminderTask {
    pub fn new(db: DbPool, notifier: Arc<NotificationService>, offset: FixedOffset, lead_minutes: i64) -> Self {
        Self {
            db,
            notifier,
            offset,
            lead: ChronoDuration::minutes(lead_minutes.max(1)),
        }
    }

    pub async fn run_cycle(&self) -> Result<usize> {
        self.run_cycle_at(Utc::now()).await
    }

    /// The student's own lead time when set, else the school default
    async fn lead_for(&self, session: &ClassSession) -> Result<ChronoDuration> {
        let prefs = preferences::load(&self.db, &session.student_id).await?;
        Ok(prefs
            .reminder_minutes_before
            .map(|minutes| ChronoDuration::minutes(minutes.max(1)))
            .unwrap_or(self.lead))
    }

    /// Remind every scheduled session starting within its lead window after `now`.
    /// Returns how many reminders were sent.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let local_now = now.with_timezone(&self.offset);
        let longest = preferences::longest_reminder_lead(&self.db)
            .await?
            .map(ChronoDuration::minutes)
            .map_or(self.lead, |lead| lead.max(self.lead));
        let horizon = local_now + longest;

        let candidates = sqlx::query_as::<_, ClassSession>(
            r#"
            SELECT * FROM class_sessions
            WHERE status = 'scheduled' AND reminder_sent = 0 AND date BETWEEN ? AND ?
            ORDER BY date, start_time
            "#,
        )
        .bind(local_now.format("%Y-%m-%d").to_string())
        .bind(horizon.format("%Y-%m-%d").to_string())
        .fetch_all(&self.db)
        .await?;

        let mut sent = 0;
        for session in candidates {
            let start = match scheduling::session_window(&session, self.offset) {
                Ok((start, _)) => start,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "Skipping session with bad time");
                    continue;
                }
            };
            if start <= local_now || start > local_now + self.lead_for(&session).await? {
                continue;
            }

            // Claim the reminder so overlapping cycles never send it twice
            let claimed = sqlx::query(
                "UPDATE class_sessions SET reminder_sent = 1 WHERE id = ? AND reminder_sent = 0",
            )
            .bind(&session.id)
            .execute(&self.db)
            .await?;
            if claimed.rows_affected() == 0 {
                continue;
            }

            let session_id = session.id.clone();
            let ctx = match scheduling::session_context(&self.db, session).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Cannot load reminder context");
                    continue;
                }
            };
            let summary = self
                .notifier
                .dispatch(&NotificationEvent::SessionReminder(ctx.notice(None)))
                .await;
            debug!(
                session_id = %session_id,
                delivered = summary.delivered,
                failed = summary.failed,
                "Reminder dispatched"
            );
            sent += 1;
        }

        if sent > 0 {
            info!(count = sent, "Class reminders sent");
        }
        Ok(sent)
    }
}

/// Spawn the periodic reminder task
pub fn spawn_reminder_task(
    db: DbPool,
    notifier: Arc<NotificationService>,
    config: &NotificationsConfig,
    offset: FixedOffset,
) {
    let interval_secs = config.reminder_interval_seconds.max(1);
    info!(
        interval_secs = interval_secs,
        lead_minutes = config.reminder_lead_minutes,
        "Starting class reminder task"
    );

    let task = ReminderTask::new(db, notifier, offset, config.reminder_lead_minutes);

    tokio::spawn(async move {
        let mut tick = interval(Duration::from_secs(interval_secs));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tick.tick().await;
            if let Err(e) = task.run_cycle().await {
                error!(error = %e, "Reminder cycle failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BookSessionRequest, Platform, Role};
    use crate::notifications::testing::RecordingChannel;
    use crate::notifications::{ChannelKind, Recipient};
    use crate::test_support::{create_course, create_user, enroll};
    use chrono::TimeZone;

    async fn setup() -> (DbPool, Arc<RecordingChannel>, ReminderTask, String) {
        let db = crate::db::init_memory().await.unwrap();
        let teacher = create_user(&db, Role::Teacher, "karim@example.com", None).await;
        let student = create_user(&db, Role::Student, "aisha@example.com", None).await;
        let course = create_course(&db, "Tajweed", None, 30).await;
        enroll(&db, &student.id, &course.id).await;

        let session = scheduling::book_session(
            &db,
            &student,
            &BookSessionRequest {
                course_id: course.id.clone(),
                teacher_id: teacher.id.clone(),
                student_id: None,
                date: "2026-03-02".into(),
                start_time: "10:00".into(),
                platform: Platform::Teams,
                notes: String::new(),
            },
        )
        .await
        .unwrap();

        let email = RecordingChannel::new(ChannelKind::Email);
        let notifier = Arc::new(NotificationService::new(db.clone(), Recipient::default()).with_channel(email.clone()));
        let offset = FixedOffset::east_opt(6 * 3600).unwrap();
        let task = ReminderTask::new(db.clone(), notifier, offset, 60);
        (db, email, task, session.id)
    }

    #[tokio::test]
    async fn test_reminder_sent_once_inside_window() {
        let (db, email, task, session_id) = setup().await;
        // 09:15 local = 03:15 UTC
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 15, 0).unwrap();

        assert_eq!(task.run_cycle_at(now).await.unwrap(), 1);
        assert_eq!(task.run_cycle_at(now).await.unwrap(), 0);
        assert_eq!(email.count(), 2);

        let session = scheduling::get_session(&db, &session_id).await.unwrap();
        assert_eq!(session.reminder_sent, 1);
    }

    #[tokio::test]
    async fn test_student_lead_time_overrides_default() {
        let (db, email, task, session_id) = setup().await;
        let session = scheduling::get_session(&db, &session_id).await.unwrap();
        preferences::update(
            &db,
            &session.student_id,
            &crate::db::UpdatePreferencesRequest {
                reminder_minutes_before: Some(180),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        // 07:30 local, outside the 60 minute default but inside 3 hours
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 1, 30, 0).unwrap();
        assert_eq!(task.run_cycle_at(now).await.unwrap(), 1);
        assert_eq!(email.count(), 2);

        // a shorter personal lead holds the reminder back
        preferences::update(
            &db,
            &session.student_id,
            &crate::db::UpdatePreferencesRequest {
                reminder_minutes_before: Some(15),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE class_sessions SET reminder_sent = 0 WHERE id = ?")
            .bind(&session_id)
            .execute(&db)
            .await
            .unwrap();
        // 09:15 local, inside the default hour but not the student's 15 minutes
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 15, 0).unwrap();
        assert_eq!(task.run_cycle_at(now).await.unwrap(), 0);
        // 09:50 local
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 3, 50, 0).unwrap();
        assert_eq!(task.run_cycle_at(now).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_no_reminder_outside_window() {
        let (_db, email, task, _) = setup().await;
        // 08:00 local, two hours early
        let early = Utc.with_ymd_and_hms(2026, 3, 2, 2, 0, 0).unwrap();
        // 10:30 local, already started
        let late = Utc.with_ymd_and_hms(2026, 3, 2, 4, 30, 0).unwrap();

        assert_eq!(task.run_cycle_at(early).await.unwrap(), 0);
        assert_eq!(task.run_cycle_at(late).await.unwrap(), 0);
        assert_eq!(email.count(), 0);
    }
}
