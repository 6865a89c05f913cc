//! Meeting sync worker.
//!
//! Request handlers only touch local state and enqueue a [`MeetingJob`]; this worker
//! talks to the meeting providers. Jobs run one at a time in arrival order, so a
//! create enqueued before a cancel for the same session is always handled first.

use anyhow::Result;
use chrono::FixedOffset;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::api::validation::parse_time;
use crate::db::{MeetingStatus, Platform};
use crate::meetings::{click_to_chat_link, MeetingProviders};
use crate::notifications::{NotificationEvent, NotificationService};
use crate::scheduling::{self, SessionContext};
use crate::DbPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeetingJob {
    Create {
        session_id: String,
    },
    Update {
        session_id: String,
    },
    /// Carries the reference because the session row no longer drives anything
    Cancel {
        session_id: String,
        platform: Platform,
        meeting_id: String,
        reason: String,
    },
}

impl MeetingJob {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Create { session_id } | Self::Update { session_id } | Self::Cancel { session_id, .. } => {
                session_id
            }
        }
    }
}

/// Applies meeting jobs against the database and the providers
pub struct MeetingSync {
    db: DbPool,
    providers: MeetingProviders,
    notifier: Arc<NotificationService>,
    offset: FixedOffset,
}

impl MeetingSync {
    pub fn new(
        db: DbPool,
        providers: MeetingProviders,
        notifier: Arc<NotificationService>,
        offset: FixedOffset,
    ) -> Self {
        Self {
            db,
            providers,
            notifier,
            offset,
        }
    }

    pub async fn handle(&self, job: MeetingJob) -> Result<()> {
        match job {
            MeetingJob::Create { session_id } => self.create(&session_id).await,
            MeetingJob::Update { session_id } => self.update(&session_id).await,
            MeetingJob::Cancel {
                session_id,
                platform,
                meeting_id,
                reason,
            } => {
                let cancelled = self.providers.cancel_meeting(platform, &meeting_id, &reason).await;
                if !cancelled {
                    warn!(
                        session_id = %session_id,
                        meeting_id = %meeting_id,
                        "Remote meeting was not cancelled; local session stays cancelled"
                    );
                }
                Ok(())
            }
        }
    }

    async fn create(&self, session_id: &str) -> Result<()> {
        let session = scheduling::get_session(&self.db, session_id).await?;
        if session.has_meeting() || session.meeting_link.as_deref().is_some_and(|l| !l.is_empty()) {
            debug!(session_id = %session_id, "Session already has a meeting, skipping create");
            return Ok(());
        }
        if !session.status_enum().is_open() {
            debug!(session_id = %session_id, status = %session.status, "Session closed, skipping create");
            return Ok(());
        }

        let ctx = scheduling::session_context(&self.db, session).await?;
        let platform = ctx.session.platform_enum();

        if platform == Platform::Whatsapp {
            return self.attach_chat_link(&ctx).await;
        }

        if !self.providers.supports(platform) {
            info!(
                session_id = %session_id,
                platform = %platform,
                "No meeting provider for platform; meeting stays pending"
            );
            return Ok(());
        }

        let request = ctx.meeting_request(self.offset)?;
        let Some(details) = self.providers.create_meeting(platform, &request).await else {
            scheduling::set_meeting_status(&self.db, session_id, MeetingStatus::Failed).await?;
            return Ok(());
        };

        let attached = scheduling::attach_meeting(
            &self.db,
            session_id,
            Some(&details.id),
            &details.join_url,
            MeetingStatus::Created,
        )
        .await?;

        if !attached {
            // Linked or closed while we were creating; the new meeting belongs to nobody
            let current = scheduling::get_session(&self.db, session_id).await?;
            let reason = if current.status_enum().is_open() {
                "Duplicate meeting"
            } else {
                "Class cancelled"
            };
            warn!(
                session_id = %session_id,
                meeting_id = %details.id,
                status = %current.status,
                "Session changed during meeting creation, cancelling new meeting"
            );
            self.providers.cancel_meeting(platform, &details.id, reason).await;
            return Ok(());
        }

        self.announce(session_id).await
    }

    async fn attach_chat_link(&self, ctx: &SessionContext) -> Result<()> {
        let start = parse_time(&ctx.session.start_time).map_err(anyhow::Error::msg)?;
        let Some(link) = click_to_chat_link(ctx.teacher.phone_number.as_deref(), &ctx.course.title, start) else {
            warn!(session_id = %ctx.session.id, "Teacher has no usable phone number for WhatsApp");
            scheduling::set_meeting_status(&self.db, &ctx.session.id, MeetingStatus::Failed).await?;
            return Ok(());
        };

        if scheduling::attach_meeting(&self.db, &ctx.session.id, None, &link, MeetingStatus::NotRequired).await? {
            info!(session_id = %ctx.session.id, "WhatsApp chat link attached");
            self.announce(&ctx.session.id).await?;
        }
        Ok(())
    }

    async fn announce(&self, session_id: &str) -> Result<()> {
        let session = scheduling::get_session(&self.db, session_id).await?;
        let ctx = scheduling::session_context(&self.db, session).await?;
        self.notifier
            .dispatch(&NotificationEvent::MeetingReady(ctx.notice(None)))
            .await;
        Ok(())
    }

    async fn update(&self, session_id: &str) -> Result<()> {
        let session = scheduling::get_session(&self.db, session_id).await?;
        if !session.status_enum().is_open() {
            debug!(session_id = %session_id, "Session closed, skipping meeting update");
            return Ok(());
        }

        let ctx = scheduling::session_context(&self.db, session).await?;
        let platform = ctx.session.platform_enum();

        if platform == Platform::Whatsapp {
            let start = parse_time(&ctx.session.start_time).map_err(anyhow::Error::msg)?;
            if let Some(link) = click_to_chat_link(ctx.teacher.phone_number.as_deref(), &ctx.course.title, start) {
                scheduling::refresh_meeting_link(&self.db, session_id, &link).await?;
            }
            return Ok(());
        }

        let Some(meeting_id) = ctx.session.meeting_id.clone().filter(|id| !id.is_empty()) else {
            // Never linked: try creating instead
            debug!(session_id = %session_id, "No meeting to update, creating");
            return self.create(session_id).await;
        };

        let update = ctx.meeting_update(self.offset)?;
        let status = if self.providers.update_meeting(platform, &meeting_id, &update).await {
            MeetingStatus::Created
        } else {
            MeetingStatus::Failed
        };
        scheduling::set_meeting_status(&self.db, session_id, status).await?;
        Ok(())
    }
}

/// FIFO consumer of meeting jobs
pub struct MeetingSyncEngine {
    sync: MeetingSync,
    rx: mpsc::Receiver<MeetingJob>,
}

impl MeetingSyncEngine {
    pub fn new(sync: MeetingSync, rx: mpsc::Receiver<MeetingJob>) -> Self {
        Self { sync, rx }
    }

    pub async fn run(mut self) {
        info!("Meeting sync engine started");

        while let Some(job) = self.rx.recv().await {
            let session_id = job.session_id().to_string();
            if let Err(e) = self.sync.handle(job).await {
                error!(session_id = %session_id, error = %e, "Meeting job failed");
            }
        }

        info!("Meeting sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BookSessionRequest, ClassSession, Role, User};
    use crate::meetings::{MeetingDetails, MeetingError, MeetingProvider, MeetingRequest, MeetingUpdate, TeamsMeetingClient};
    use crate::notifications::testing::RecordingChannel;
    use crate::notifications::{ChannelKind, Recipient};
    use crate::test_support::{create_course, create_user, enroll, teams_config, FakeServer, Hits};
    use axum::{
        http::StatusCode,
        routing::{patch, post},
        Json, Router,
    };
    use serde_json::{json, Value};

    const EVENTS: &str = "/v1.0/users/classes@example.com/events";

    fn graph(hits: Hits, token_ok: bool, cancel_status: StatusCode) -> Router {
        let token_hits = hits.clone();
        let events_hits = hits.clone();
        let patch_hits = hits.clone();
        let cancel_hits = hits;
        Router::new()
            .route(
                "/tenant-1/oauth2/v2.0/token",
                post(move || {
                    token_hits.hit("token");
                    async move {
                        if token_ok {
                            (StatusCode::OK, Json(json!({"access_token": "tok", "expires_in": 3600})))
                        } else {
                            (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid_client"})))
                        }
                    }
                }),
            )
            .route(
                EVENTS,
                post(move |Json(body): Json<Value>| {
                    events_hits.hit("events");
                    async move {
                        (
                            StatusCode::CREATED,
                            Json(json!({
                                "id": "AAMkAG-42",
                                "subject": body["subject"],
                                "onlineMeeting": {"joinUrl": "https://teams.microsoft.com/l/meetup-join/42"}
                            })),
                        )
                    }
                }),
            )
            .route(
                &format!("{}/AAMkAG-42", EVENTS),
                patch(move || {
                    patch_hits.hit("patch");
                    async { Json(json!({"id": "AAMkAG-42"})) }
                }),
            )
            .route(
                &format!("{}/AAMkAG-42/cancel", EVENTS),
                post(move || {
                    cancel_hits.hit("cancel");
                    async move { cancel_status }
                }),
            )
    }

    /// Provider that lets a test change the session while a call is in flight
    struct ScriptedProvider {
        db: DbPool,
        hits: Hits,
        cancel_session_during_create: bool,
        update_ok: bool,
    }

    #[async_trait::async_trait]
    impl MeetingProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn create_meeting(&self, request: &MeetingRequest) -> Result<MeetingDetails, MeetingError> {
            self.hits.hit("create");
            if self.cancel_session_during_create {
                sqlx::query("UPDATE class_sessions SET status = 'cancelled' WHERE id = ?")
                    .bind(request.transaction_id.as_deref())
                    .execute(&self.db)
                    .await
                    .unwrap();
            }
            Ok(MeetingDetails {
                id: "EVT-1".into(),
                join_url: "https://teams.microsoft.com/l/meetup-join/evt-1".into(),
                subject: request.subject.clone(),
                start: request.start,
                end: request.end,
            })
        }

        async fn update_meeting(&self, _: &str, _: &MeetingUpdate) -> Result<(), MeetingError> {
            self.hits.hit("update");
            if self.update_ok {
                Ok(())
            } else {
                Err(MeetingError::Provider {
                    status: 404,
                    body: "event not found".into(),
                })
            }
        }

        async fn cancel_meeting(&self, meeting_id: &str, _: &str) -> Result<(), MeetingError> {
            self.hits.hit(&format!("cancel:{}", meeting_id));
            Ok(())
        }
    }

    fn scripted_sync(f: &Fixture, cancel_session_during_create: bool, update_ok: bool) -> (MeetingSync, Hits) {
        let hits = Hits::default();
        let provider = ScriptedProvider {
            db: f.db.clone(),
            hits: hits.clone(),
            cancel_session_during_create,
            update_ok,
        };
        let providers = MeetingProviders::new().with_provider(Platform::Teams, Arc::new(provider) as Arc<dyn MeetingProvider>);
        let notifier = Arc::new(NotificationService::new(f.db.clone(), Recipient::default()).with_channel(f.email.clone()));
        let offset = FixedOffset::east_opt(6 * 3600).unwrap();
        (MeetingSync::new(f.db.clone(), providers, notifier, offset), hits)
    }

    struct Fixture {
        db: DbPool,
        teacher: User,
        student: User,
        course_id: String,
        email: Arc<RecordingChannel>,
        sync: MeetingSync,
    }

    async fn fixture(server: &FakeServer) -> Fixture {
        let db = crate::db::init_memory().await.unwrap();
        let teacher = create_user(&db, Role::Teacher, "karim@example.com", Some("+8801700000001")).await;
        let student = create_user(&db, Role::Student, "aisha@example.com", None).await;
        let course = create_course(&db, "Tajweed", Some(150_000), 60).await;
        enroll(&db, &student.id, &course.id).await;

        let teams = TeamsMeetingClient::new(&teams_config(&server.url(), &format!("{}/v1.0", server.url()))).unwrap();
        let providers = MeetingProviders::new()
            .with_provider(Platform::Teams, Arc::new(teams) as Arc<dyn MeetingProvider>);

        let email = RecordingChannel::new(ChannelKind::Email);
        let notifier = Arc::new(NotificationService::new(db.clone(), Recipient::default()).with_channel(email.clone()));
        let offset = FixedOffset::east_opt(6 * 3600).unwrap();

        Fixture {
            sync: MeetingSync::new(db.clone(), providers, notifier, offset),
            db,
            teacher,
            student,
            course_id: course.id,
            email,
        }
    }

    async fn book(f: &Fixture, platform: Platform) -> ClassSession {
        scheduling::book_session(
            &f.db,
            &f.student,
            &BookSessionRequest {
                course_id: f.course_id.clone(),
                teacher_id: f.teacher.id.clone(),
                student_id: None,
                date: "2026-03-02".into(),
                start_time: "10:00".into(),
                platform,
                notes: String::new(),
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_booking_gets_join_url_and_meeting_id() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;
        assert_eq!(session.end_time, "11:00");

        f.sync
            .handle(MeetingJob::Create {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.meeting_id.as_deref(), Some("AAMkAG-42"));
        assert_eq!(
            session.meeting_link.as_deref(),
            Some("https://teams.microsoft.com/l/meetup-join/42")
        );
        assert_eq!(session.meeting_status_enum(), MeetingStatus::Created);

        // MeetingReady to teacher and student
        assert_eq!(f.email.count(), 2);
        let (_, message) = &f.email.sent.lock().unwrap()[0];
        assert!(message.text.contains("https://teams.microsoft.com/l/meetup-join/42"));
    }

    #[tokio::test]
    async fn test_create_is_skipped_once_linked() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;

        for _ in 0..2 {
            f.sync
                .handle(MeetingJob::Create {
                    session_id: session.id.clone(),
                })
                .await
                .unwrap();
        }
        assert_eq!(server.hits("events"), 1);
    }

    #[tokio::test]
    async fn test_identity_failure_marks_meeting_failed() {
        let server = FakeServer::start(|hits| graph(hits, false, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;

        f.sync
            .handle(MeetingJob::Create {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.meeting_status_enum(), MeetingStatus::Failed);
        assert!(!session.has_meeting());
        assert_eq!(server.hits("events"), 0);
        assert_eq!(f.email.count(), 0);
    }

    #[tokio::test]
    async fn test_remote_cancel_failure_keeps_local_cancel() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::INTERNAL_SERVER_ERROR)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;
        f.sync
            .handle(MeetingJob::Create {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        let cancelled = scheduling::cancel_session(&f.db, &f.student, &session.id, "Travelling")
            .await
            .unwrap();
        assert_eq!(cancelled.status, "cancelled");

        f.sync
            .handle(MeetingJob::Cancel {
                session_id: session.id.clone(),
                platform: Platform::Teams,
                meeting_id: "AAMkAG-42".into(),
                reason: "Travelling".into(),
            })
            .await
            .unwrap();

        // 1 attempt + 2 retries on 500
        assert_eq!(server.hits("cancel"), 3);
        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.status, "cancelled");
    }

    #[tokio::test]
    async fn test_reschedule_patches_existing_meeting() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;
        f.sync
            .handle(MeetingJob::Create {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        scheduling::reschedule_session(
            &f.db,
            &f.student,
            &session.id,
            &crate::db::RescheduleRequest {
                date: "2026-03-03".into(),
                start_time: "15:00".into(),
                reason: String::new(),
            },
        )
        .await
        .unwrap();
        f.sync
            .handle(MeetingJob::Update {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        assert_eq!(server.hits("patch"), 1);
        assert_eq!(server.hits("events"), 1);
        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.meeting_status_enum(), MeetingStatus::Created);
    }

    #[tokio::test]
    async fn test_session_cancelled_during_create_drops_new_meeting() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;
        let (sync, hits) = scripted_sync(&f, true, true);

        sync.handle(MeetingJob::Create {
            session_id: session.id.clone(),
        })
        .await
        .unwrap();

        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.status, "cancelled");
        assert!(!session.has_meeting());
        assert_eq!(session.meeting_link, None);
        assert_eq!(hits.get("create"), 1);
        assert_eq!(hits.get("cancel:EVT-1"), 1);
        // no MeetingReady for a cancelled class
        assert_eq!(f.email.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_update_marks_meeting_failed() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;
        let (sync, hits) = scripted_sync(&f, false, false);
        sync.handle(MeetingJob::Create {
            session_id: session.id.clone(),
        })
        .await
        .unwrap();

        sync.handle(MeetingJob::Update {
            session_id: session.id.clone(),
        })
        .await
        .unwrap();

        assert_eq!(hits.get("update"), 1);
        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.meeting_status_enum(), MeetingStatus::Failed);
        assert_eq!(session.meeting_id.as_deref(), Some("EVT-1"));

        // a later successful update clears the failure
        let (sync, _) = scripted_sync(&f, false, true);
        sync.handle(MeetingJob::Update {
            session_id: session.id.clone(),
        })
        .await
        .unwrap();
        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.meeting_status_enum(), MeetingStatus::Created);
    }

    #[tokio::test]
    async fn test_whatsapp_session_gets_chat_link() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Whatsapp).await;

        f.sync
            .handle(MeetingJob::Create {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert!(session.meeting_link.as_deref().unwrap().starts_with("https://wa.me/8801700000001?text="));
        assert_eq!(session.meeting_status_enum(), MeetingStatus::NotRequired);
        assert!(!session.has_meeting());
        assert_eq!(server.hits("token"), 0);
    }

    #[tokio::test]
    async fn test_unsupported_platform_stays_pending() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Zoom).await;

        f.sync
            .handle(MeetingJob::Create {
                session_id: session.id.clone(),
            })
            .await
            .unwrap();

        let session = scheduling::get_session(&f.db, &session.id).await.unwrap();
        assert_eq!(session.meeting_status_enum(), MeetingStatus::Pending);
        assert_eq!(server.hits("events"), 0);
    }

    #[tokio::test]
    async fn test_engine_drains_jobs_in_order() {
        let server = FakeServer::start(|hits| graph(hits, true, StatusCode::ACCEPTED)).await;
        let f = fixture(&server).await;
        let session = book(&f, Platform::Teams).await;

        let (tx, rx) = mpsc::channel(8);
        tx.send(MeetingJob::Create {
            session_id: session.id.clone(),
        })
        .await
        .unwrap();
        tx.send(MeetingJob::Update {
            session_id: session.id.clone(),
        })
        .await
        .unwrap();
        drop(tx);

        MeetingSyncEngine::new(f.sync, rx).run().await;

        assert_eq!(server.hits("events"), 1);
        assert_eq!(server.hits("patch"), 1);
    }
}
