mod assessments;
pub mod auth;
mod availability;
mod courses;
pub mod error;
pub mod metrics;
mod payments;
mod preferences;
pub mod rate_limit;
mod sessions;
pub mod validation;
mod webhooks;

use axum::{
    http::{header, HeaderValue, Method},
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::AppState;

/// CORS for the configured frontend origins. Unparseable entries are skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

pub fn create_router(state: Arc<AppState>) -> Router {
    // Login and signup get the strict per-IP budget
    let auth_routes = Router::new()
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_auth,
        ));

    // Catalog, intake form and teacher slots are open to visitors
    let public_routes = Router::new()
        .route("/courses", get(courses::list_courses))
        .route("/courses/:id", get(courses::get_course))
        .route("/assessments", post(assessments::create_assessment))
        .route("/teachers/:id/availability", get(availability::teacher_slots));

    let protected_routes = Router::new()
        .route("/auth/me", get(auth::me))
        .route("/auth/logout", post(auth::logout))
        .route(
            "/notification-preferences",
            get(preferences::get_preferences).put(preferences::update_preferences),
        )
        // Courses
        .route("/courses", post(courses::create_course))
        .route("/courses/:id/enroll", post(courses::enroll))
        // Assessments
        .route("/assessments", get(assessments::list_assessments))
        .route("/assessments/:id/schedule-trial", post(assessments::schedule_trial))
        // Sessions
        .route("/sessions", get(sessions::list_sessions).post(sessions::book_session))
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id/reschedule", post(sessions::reschedule_session))
        .route("/sessions/:id/cancel", post(sessions::cancel_session))
        .route("/sessions/:id/complete", post(sessions::complete_session))
        .route("/sessions/:id/meeting", post(sessions::retry_meeting))
        // Availability
        .route(
            "/availability",
            get(availability::list_availability).post(availability::create_availability),
        )
        .route("/availability/:id", delete(availability::delete_availability))
        // Payments
        .route("/payments", get(payments::list_payments))
        .route("/payments/checkout", post(payments::checkout))
        .route("/payments/:id/invoice", get(payments::download_invoice))
        .route("/payments/:id/refund", post(payments::refund_payment))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    let api_routes = Router::new()
        .nest("/auth", auth_routes)
        .merge(public_routes)
        .merge(protected_routes)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_api,
        ));

    let webhook_routes = Router::new()
        .route("/stripe", post(webhooks::stripe_webhook))
        .route("/sslcommerz/ipn", post(webhooks::sslcommerz_ipn))
        .route("/sslcommerz/success", post(webhooks::sslcommerz_success))
        .route("/sslcommerz/fail", post(webhooks::sslcommerz_fail))
        .route("/sslcommerz/cancel", post(webhooks::sslcommerz_cancel))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::rate_limit_webhook,
        ));

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics::metrics_endpoint))
        .nest("/api", api_routes.layer(cors))
        .nest("/webhooks", webhook_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CompressionLayer::new())
                .layer(middleware::from_fn(metrics::metrics_middleware)),
        )
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Role;
    use crate::engine::MeetingJob;
    use crate::notifications::{NotificationService, Recipient};
    use crate::payments::PaymentGateways;
    use crate::test_support::{create_course, create_user, enroll, test_state, FakeServer};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    async fn serve() -> (FakeServer, crate::DbPool, mpsc::Receiver<MeetingJob>) {
        let db = crate::db::init_memory().await.unwrap();
        let notifier = NotificationService::new(db.clone(), Recipient::default());
        let (state, rx) = test_state(db.clone(), notifier, PaymentGateways::default());
        let server = FakeServer::start(|_| create_router(state)).await;
        (server, db, rx)
    }

    #[tokio::test]
    async fn test_health_and_auth_guard() {
        let (server, _db, _rx) = serve().await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/health", server.url())).send().await.unwrap();
        assert_eq!(health.status(), 200);
        assert_eq!(health.text().await.unwrap(), "OK");

        let me = client.get(format!("{}/api/auth/me", server.url())).send().await.unwrap();
        assert_eq!(me.status(), 401);
        let body: Value = me.json().await.unwrap();
        assert_eq!(body["error"]["code"], "unauthorized");
    }

    #[tokio::test]
    async fn test_cors_allows_configured_frontend() {
        let (server, _db, _rx) = serve().await;
        let response = reqwest::Client::new()
            .get(format!("{}/api/courses", server.url()))
            .header("Origin", "http://localhost:3000")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );

        let foreign = reqwest::Client::new()
            .get(format!("{}/api/courses", server.url()))
            .header("Origin", "https://evil.example")
            .send()
            .await
            .unwrap();
        assert!(foreign.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_signup_then_me() {
        let (server, _db, _rx) = serve().await;
        let client = reqwest::Client::new();

        let signup = client
            .post(format!("{}/api/auth/signup", server.url()))
            .json(&json!({
                "email": "Aisha@Example.com",
                "password": "bismillah-123",
                "first_name": "Aisha",
                "last_name": "Rahman"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(signup.status(), 201);
        let login: Value = signup.json().await.unwrap();
        assert_eq!(login["user"]["email"], "aisha@example.com");
        assert_eq!(login["user"]["role"], "student");
        let token = login["token"].as_str().unwrap();

        let me: Value = client
            .get(format!("{}/api/auth/me", server.url()))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(me["email"], "aisha@example.com");

        let admin_signup = client
            .post(format!("{}/api/auth/signup", server.url()))
            .json(&json!({
                "email": "boss@example.com",
                "password": "bismillah-123",
                "first_name": "Boss",
                "role": "admin"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(admin_signup.status(), 403);
    }

    #[tokio::test]
    async fn test_assessment_intake_is_public_but_listing_is_admin_only() {
        let (server, db, _rx) = serve().await;
        let client = reqwest::Client::new();

        let created = client
            .post(format!("{}/api/assessments", server.url()))
            .json(&json!({ "full_name": "Yusuf", "phone_number": "+8801712345678", "age": 11 }))
            .send()
            .await
            .unwrap();
        assert_eq!(created.status(), 201);

        let student = create_user(&db, Role::Student, "s@example.com", None).await;
        let token = auth::issue_token(&db, &student.id, 1).await.unwrap();
        let listed = client
            .get(format!("{}/api/assessments", server.url()))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(listed.status(), 403);
    }

    #[tokio::test]
    async fn test_booking_queues_meeting_creation() {
        let (server, db, mut rx) = serve().await;
        let teacher = create_user(&db, Role::Teacher, "karim@example.com", None).await;
        let student = create_user(&db, Role::Student, "aisha@example.com", None).await;
        let course = create_course(&db, "Tajweed", None, 60).await;
        enroll(&db, &student.id, &course.id).await;
        let token = auth::issue_token(&db, &student.id, 1).await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("{}/api/sessions", server.url()))
            .bearer_auth(&token)
            .json(&json!({
                "course_id": course.id,
                "teacher_id": teacher.id,
                "date": "2026-03-02",
                "start_time": "10:00"
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        let session: Value = response.json().await.unwrap();
        assert_eq!(session["end_time"], "11:00");
        assert_eq!(session["meeting_status"], "pending");

        let job = rx.recv().await.unwrap();
        assert_eq!(
            job,
            MeetingJob::Create {
                session_id: session["id"].as_str().unwrap().to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_notification_preferences_round_trip() {
        let (server, db, _rx) = serve().await;
        let student = create_user(&db, Role::Student, "aisha@example.com", None).await;
        let token = auth::issue_token(&db, &student.id, 1).await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/api/notification-preferences", server.url());

        let defaults: Value = client.get(&url).bearer_auth(&token).send().await.unwrap().json().await.unwrap();
        assert_eq!(defaults["email_class_reminder"], 1);
        assert!(defaults["reminder_minutes_before"].is_null());

        let updated = client
            .put(&url)
            .bearer_auth(&token)
            .json(&json!({ "whatsapp_class_updates": false, "reminder_minutes_before": 30 }))
            .send()
            .await
            .unwrap();
        assert_eq!(updated.status(), 200);
        let updated: Value = updated.json().await.unwrap();
        assert_eq!(updated["whatsapp_class_updates"], 0);
        assert_eq!(updated["email_class_updates"], 1);
        assert_eq!(updated["reminder_minutes_before"], 30);

        let rejected = client
            .put(&url)
            .bearer_auth(&token)
            .json(&json!({ "reminder_minutes_before": 2 }))
            .send()
            .await
            .unwrap();
        assert_eq!(rejected.status(), 400);
        let body: Value = rejected.json().await.unwrap();
        assert!(body["error"]["details"]["reminder_minutes_before"].is_array());
    }

    #[tokio::test]
    async fn test_invoice_download_for_payer_and_admin_only() {
        use crate::db::{Gateway, PaymentStatus};
        use crate::payments::{apply_outcome, SettlementOutcome};

        let (server, db, _rx) = serve().await;
        let payment = crate::payments::tests::pending_payment(&db, Gateway::Stripe).await;
        let payer_token = auth::issue_token(&db, &payment.user_id, 1).await.unwrap();
        let stranger = create_user(&db, Role::Student, "stranger@example.com", None).await;
        let stranger_token = auth::issue_token(&db, &stranger.id, 1).await.unwrap();
        let admin = create_user(&db, Role::Admin, "admin@example.com", None).await;
        let admin_token = auth::issue_token(&db, &admin.id, 1).await.unwrap();
        let client = reqwest::Client::new();
        let url = format!("{}/api/payments/{}/invoice", server.url(), payment.id);

        // nothing to download before the payment is paid
        let pending = client.get(&url).bearer_auth(&payer_token).send().await.unwrap();
        assert_eq!(pending.status(), 404);

        apply_outcome(
            &db,
            &SettlementOutcome {
                gateway: Gateway::Stripe,
                external_id: "evt_inv".into(),
                transaction_id: payment.transaction_id.clone(),
                status: PaymentStatus::Paid,
                gateway_transaction_id: None,
                payload: None,
            },
        )
        .await
        .unwrap();

        let download = client.get(&url).bearer_auth(&payer_token).send().await.unwrap();
        assert_eq!(download.status(), 200);
        assert!(download.headers()["content-disposition"]
            .to_str()
            .unwrap()
            .contains(&format!("invoice_{}.txt", payment.invoice_number)));
        let text = download.text().await.unwrap();
        assert!(text.contains(&payment.invoice_number));

        let foreign = client.get(&url).bearer_auth(&stranger_token).send().await.unwrap();
        assert_eq!(foreign.status(), 404);

        let by_admin = client.get(&url).bearer_auth(&admin_token).send().await.unwrap();
        assert_eq!(by_admin.status(), 200);
    }

    #[tokio::test]
    async fn test_retry_replays_failed_meeting_update() {
        let (server, db, mut rx) = serve().await;
        let teacher = create_user(&db, Role::Teacher, "karim@example.com", None).await;
        let student = create_user(&db, Role::Student, "aisha@example.com", None).await;
        let course = create_course(&db, "Tajweed", None, 60).await;
        enroll(&db, &student.id, &course.id).await;
        let session = crate::scheduling::book_session(
            &db,
            &student,
            &crate::db::BookSessionRequest {
                course_id: course.id.clone(),
                teacher_id: teacher.id.clone(),
                student_id: None,
                date: "2026-03-02".into(),
                start_time: "10:00".into(),
                platform: crate::db::Platform::Teams,
                notes: String::new(),
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE class_sessions SET meeting_id = 'EVT-1', meeting_link = 'https://join/1', meeting_status = 'failed' WHERE id = ?")
            .bind(&session.id)
            .execute(&db)
            .await
            .unwrap();
        let token = auth::issue_token(&db, &student.id, 1).await.unwrap();

        let response = reqwest::Client::new()
            .post(format!("{}/api/sessions/{}/meeting", server.url(), session.id))
            .bearer_auth(&token)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 202);
        assert_eq!(
            rx.recv().await.unwrap(),
            MeetingJob::Update {
                session_id: session.id.clone()
            }
        );
    }
}
