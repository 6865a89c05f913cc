//! Shared fixtures for unit tests: in-process fake HTTP upstreams and seed rows.

use axum::Router;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{Config, TeamsConfig};
use crate::db::{Course, Role, User};
use crate::engine::MeetingJob;
use crate::notifications::NotificationService;
use crate::payments::PaymentGateways;
use crate::{AppState, DbPool};

/// Request counters keyed by a name the fake route chooses
#[derive(Clone, Default)]
pub struct Hits(Arc<DashMap<String, usize>>);

impl Hits {
    pub fn hit(&self, key: &str) {
        *self.0.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, key: &str) -> usize {
        self.0.get(key).map(|v| *v).unwrap_or(0)
    }
}

/// An axum router served on 127.0.0.1 with an ephemeral port
pub struct FakeServer {
    addr: SocketAddr,
    hits: Hits,
    handle: JoinHandle<()>,
}

impl FakeServer {
    pub async fn start<F>(build: F) -> Self
    where
        F: FnOnce(Hits) -> Router,
    {
        let hits = Hits::default();
        let router = build(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        Self { addr, hits, handle }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn hits(&self, key: &str) -> usize {
        self.hits.get(key)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub fn teams_config(authority_url: &str, graph_base_url: &str) -> TeamsConfig {
    TeamsConfig {
        tenant_id: "tenant-1".into(),
        client_id: "client-1".into(),
        client_secret: "secret-1".into(),
        organizer: "classes@example.com".into(),
        authority_url: authority_url.to_string(),
        graph_base_url: graph_base_url.to_string(),
        scope: "https://graph.microsoft.com/.default".into(),
        request_timeout_seconds: 5,
        max_retries: 2,
        retry_base_delay_ms: 1,
    }
}

pub async fn create_user(db: &DbPool, role: Role, email: &str, phone: Option<&str>) -> User {
    let id = uuid::Uuid::new_v4().to_string();
    let now = crate::db::timestamp();
    let first_name = email.split('@').next().unwrap_or("user");
    sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, first_name, last_name, role, phone_number, is_active, created_at, updated_at)
        VALUES (?, ?, 'not-a-hash', ?, '', ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(email)
    .bind(first_name)
    .bind(role.to_string())
    .bind(phone)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .unwrap();

    sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(db)
        .await
        .unwrap()
}

pub async fn create_course(db: &DbPool, title: &str, price_minor: Option<i64>, duration: i64) -> Course {
    let id = uuid::Uuid::new_v4().to_string();
    let now = crate::db::timestamp();
    sqlx::query(
        r#"
        INSERT INTO courses (id, title, slug, course_type, description, price_minor, currency, session_duration_minutes, is_active, created_at, updated_at)
        VALUES (?, ?, ?, 'quran', '', ?, 'BDT', ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(title)
    .bind(crate::db::slugify(title))
    .bind(price_minor)
    .bind(duration)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .unwrap();

    sqlx::query_as("SELECT * FROM courses WHERE id = ?")
        .bind(&id)
        .fetch_one(db)
        .await
        .unwrap()
}

pub async fn enroll(db: &DbPool, student_id: &str, course_id: &str) {
    let now = crate::db::timestamp();
    sqlx::query(
        "INSERT INTO enrollments (id, student_id, course_id, status, created_at, updated_at) VALUES (?, ?, ?, 'active', ?, ?)",
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(student_id)
    .bind(course_id)
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .unwrap();
}

/// App state over `db` with default config; the receiver sees queued meeting jobs
pub fn test_state(
    db: DbPool,
    notifier: NotificationService,
    payments: PaymentGateways,
) -> (Arc<AppState>, mpsc::Receiver<MeetingJob>) {
    let (meeting_tx, meeting_rx) = mpsc::channel(16);
    let state = AppState::new(Config::default(), db, meeting_tx, Arc::new(notifier), Arc::new(payments));
    (Arc::new(state), meeting_rx)
}
