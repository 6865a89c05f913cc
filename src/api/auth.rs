use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::Response,
    Extension, Json,
};
use chrono::{Duration, SecondsFormat, Utc};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use super::error::{ApiError, ValidationErrorBuilder};
use super::validation::{validate_email, validate_password, validate_phone};
use crate::config::AuthConfig;
use crate::db::{self, LoginRequest, LoginResponse, Role, SignupRequest, User, UserResponse};
use crate::{AppState, DbPool};

/// Hash a password using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

fn generate_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    hex::encode(bytes)
}

/// Tokens are stored hashed so a leaked database cannot be replayed
fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub(crate) async fn issue_token(db: &DbPool, user_id: &str, ttl_days: i64) -> Result<String, ApiError> {
    let token = generate_token();
    let expires_at = (Utc::now() + Duration::days(ttl_days.max(1))).to_rfc3339_opts(SecondsFormat::Secs, true);

    sqlx::query(
        "INSERT INTO auth_sessions (id, user_id, token_hash, expires_at, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(user_id)
    .bind(hash_token(&token))
    .bind(&expires_at)
    .bind(db::timestamp())
    .execute(db)
    .await?;

    Ok(token)
}

async fn find_user_by_email(db: &DbPool, email: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(email.trim().to_lowercase())
        .fetch_optional(db)
        .await
}

async fn insert_user(
    db: &DbPool,
    req: &SignupRequest,
    role: Role,
    password_hash: &str,
) -> Result<User, ApiError> {
    let id = Uuid::new_v4().to_string();
    let now = db::timestamp();
    sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, first_name, last_name, role, phone_number, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(req.email.trim().to_lowercase())
    .bind(password_hash)
    .bind(req.first_name.trim())
    .bind(req.last_name.trim())
    .bind(role.to_string())
    .bind(req.phone_number.as_deref().map(str::trim).filter(|p| !p.is_empty()))
    .bind(&now)
    .bind(&now)
    .execute(db)
    .await
    .map_err(|e| {
        if db::is_unique_violation(&e) {
            ApiError::conflict("An account with this email already exists")
        } else {
            e.into()
        }
    })?;

    Ok(sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(db)
        .await?)
}

/// POST /api/auth/signup
pub async fn signup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<LoginResponse>), ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    errors
        .check("email", validate_email(req.email.trim()))
        .check("password", validate_password(&req.password));
    if let Some(phone) = req.phone_number.as_deref().filter(|p| !p.trim().is_empty()) {
        errors.check("phone_number", validate_phone(phone.trim()));
    }
    errors.finish()?;

    let role = req.role.unwrap_or(Role::Student);
    if role == Role::Admin {
        return Err(ApiError::forbidden("Admin accounts cannot be created through signup"));
    }

    let password_hash = hash_password(&req.password)
        .map_err(|e| ApiError::internal(format!("Failed to hash password: {}", e)))?;
    let user = insert_user(&state.db, &req, role, &password_hash).await?;
    let token = issue_token(&state.db, &user.id, state.config.auth.session_ttl_days).await?;

    info!(user_id = %user.id, role = %role, "User signed up");
    Ok((
        StatusCode::CREATED,
        Json(LoginResponse {
            token,
            user: UserResponse::from(user),
        }),
    ))
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let invalid = || ApiError::unauthorized("Invalid credentials");

    let user = find_user_by_email(&state.db, &req.email)
        .await?
        .ok_or_else(invalid)?;
    if user.is_active == 0 || !verify_password(&req.password, &user.password_hash) {
        return Err(invalid());
    }

    let token = issue_token(&state.db, &user.id, state.config.auth.session_ttl_days).await?;
    info!(user_id = %user.id, "User logged in");

    Ok(Json(LoginResponse {
        token,
        user: UserResponse::from(user),
    }))
}

/// GET /api/auth/me
pub async fn me(Extension(user): Extension<User>) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

/// POST /api/auth/logout
pub async fn logout(State(state): State<Arc<AppState>>, request: Request<Body>) -> Result<StatusCode, ApiError> {
    if let Some(token) = bearer_token(&request) {
        sqlx::query("DELETE FROM auth_sessions WHERE token_hash = ?")
            .bind(hash_token(token))
            .execute(&state.db)
            .await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

fn bearer_token(request: &Request<Body>) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Resolve a bearer token to an active user
pub async fn user_for_token(db: &DbPool, token: &str) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(
        r#"
        SELECT u.* FROM auth_sessions s
        JOIN users u ON u.id = s.user_id
        WHERE s.token_hash = ? AND s.expires_at > ? AND u.is_active = 1
        "#,
    )
    .bind(hash_token(token))
    .bind(db::timestamp())
    .fetch_optional(db)
    .await
}

/// Auth middleware: validates the bearer token and makes the `User` available to handlers
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let token = bearer_token(&request).ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;
    let user = user_for_token(&state.db, token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

pub fn require_admin(user: &User) -> Result<(), ApiError> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(ApiError::forbidden("Admin access required"))
    }
}

/// Create the configured admin account on first start
pub async fn ensure_admin_user(db: &DbPool, config: &AuthConfig) -> anyhow::Result<()> {
    let (Some(email), Some(password)) = (&config.admin_email, &config.admin_password) else {
        return Ok(());
    };
    if find_user_by_email(db, email).await?.is_some() {
        return Ok(());
    }

    let password_hash =
        hash_password(password).map_err(|e| anyhow::anyhow!("Failed to hash admin password: {}", e))?;
    let req = SignupRequest {
        email: email.clone(),
        password: String::new(),
        first_name: "Admin".to_string(),
        last_name: String::new(),
        phone_number: None,
        role: Some(Role::Admin),
    };
    insert_user(db, &req, Role::Admin, &password_hash)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create admin user: {}", e))?;

    info!(email = %email, "Created admin user from configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hash_roundtrip() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_token_hash_is_stable_and_distinct() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_token(&token), hash_token(&token));
        assert_ne!(hash_token(&token), token);
        assert_ne!(generate_token(), token);
    }

    #[tokio::test]
    async fn test_issued_token_resolves_to_user() {
        let db = crate::db::init_memory().await.unwrap();
        let user = crate::test_support::create_user(&db, Role::Teacher, "t@example.com", None).await;

        let token = issue_token(&db, &user.id, 7).await.unwrap();
        let found = user_for_token(&db, &token).await.unwrap().unwrap();
        assert_eq!(found.id, user.id);
        assert!(user_for_token(&db, "bogus").await.unwrap().is_none());

        sqlx::query("UPDATE users SET is_active = 0 WHERE id = ?")
            .bind(&user.id)
            .execute(&db)
            .await
            .unwrap();
        assert!(user_for_token(&db, &token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let db = crate::db::init_memory().await.unwrap();
        let user = crate::test_support::create_user(&db, Role::Student, "s@example.com", None).await;
        let token = issue_token(&db, &user.id, 7).await.unwrap();
        sqlx::query("UPDATE auth_sessions SET expires_at = '2000-01-01T00:00:00Z'")
            .execute(&db)
            .await
            .unwrap();
        assert!(user_for_token(&db, &token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ensure_admin_user_is_idempotent() {
        let db = crate::db::init_memory().await.unwrap();
        let config = AuthConfig {
            admin_email: Some("Admin@AmarQuran.test".into()),
            admin_password: Some("s3cret-pass".into()),
            ..Default::default()
        };

        ensure_admin_user(&db, &config).await.unwrap();
        ensure_admin_user(&db, &config).await.unwrap();

        let admins: Vec<User> = sqlx::query_as("SELECT * FROM users WHERE role = 'admin'")
            .fetch_all(&db)
            .await
            .unwrap();
        assert_eq!(admins.len(), 1);
        assert_eq!(admins[0].email, "admin@amarquran.test");
        assert!(verify_password("s3cret-pass", &admins[0].password_hash));
    }
}
