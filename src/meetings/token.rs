//! OAuth2 client-credentials tokens for the meeting provider.
//!
//! The bearer token is cached until shortly before it expires. The cache lock is
//! held across a refresh so concurrent callers wait for one token request.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::MeetingError;
use crate::config::TeamsConfig;

/// Refresh this long before the provider-reported expiry
const EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String, MeetingError>;

    /// Drop the cached token, e.g. after the API answered 401
    async fn invalidate(&self);
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default)]
    pub token_type: String,
}

fn default_expires_in() -> u64 {
    3599
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

pub struct ClientCredentialsProvider {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    scope: String,
    cache: Mutex<Option<CachedToken>>,
}

impl ClientCredentialsProvider {
    pub fn new(client: reqwest::Client, config: &TeamsConfig) -> Self {
        Self {
            client,
            token_url: format!(
                "{}/{}/oauth2/v2.0/token",
                config.authority_url.trim_end_matches('/'),
                config.tenant_id
            ),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            scope: config.scope.clone(),
            cache: Mutex::new(None),
        }
    }

    /// Exchange the client id and secret for a fresh token, bypassing the cache
    pub async fn authenticate(&self) -> Result<TokenResponse, MeetingError> {
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", self.scope.as_str()),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| MeetingError::Auth(format!("token endpoint unreachable: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Identity provider rejected client credentials");
            return Err(MeetingError::Auth(format!("{} - {}", status, body)));
        }

        response
            .json::<TokenResponse>()
            .await
            .map_err(|e| MeetingError::Auth(format!("malformed token response: {}", e)))
    }
}

#[async_trait]
impl AccessTokenProvider for ClientCredentialsProvider {
    async fn access_token(&self) -> Result<String, MeetingError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.authenticate().await?;
        let lifetime = Duration::from_secs(fresh.expires_in).saturating_sub(EXPIRY_SKEW);
        debug!(expires_in = fresh.expires_in, "Obtained meeting provider access token");

        let value = fresh.access_token;
        *cache = Some(CachedToken {
            value: value.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(value)
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServer;
    use axum::{routing::post, Json, Router};
    use serde_json::json;

    fn config(authority: &str) -> TeamsConfig {
        crate::test_support::teams_config(authority, "http://127.0.0.1:1")
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let server = FakeServer::start(|hits| {
            Router::new().route(
                "/tenant-1/oauth2/v2.0/token",
                post(move || {
                    hits.hit("token");
                    async { Json(json!({"access_token": "tok-1", "expires_in": 3600, "token_type": "Bearer"})) }
                }),
            )
        })
        .await;

        let provider = ClientCredentialsProvider::new(reqwest::Client::new(), &config(&server.url()));
        assert_eq!(provider.access_token().await.unwrap(), "tok-1");
        assert_eq!(provider.access_token().await.unwrap(), "tok-1");
        assert_eq!(server.hits("token"), 1);

        provider.invalidate().await;
        provider.access_token().await.unwrap();
        assert_eq!(server.hits("token"), 2);
    }

    #[tokio::test]
    async fn test_short_lived_token_is_not_cached() {
        let server = FakeServer::start(|hits| {
            Router::new().route(
                "/tenant-1/oauth2/v2.0/token",
                post(move || {
                    hits.hit("token");
                    async { Json(json!({"access_token": "tok", "expires_in": 30})) }
                }),
            )
        })
        .await;

        let provider = ClientCredentialsProvider::new(reqwest::Client::new(), &config(&server.url()));
        provider.access_token().await.unwrap();
        provider.access_token().await.unwrap();
        assert_eq!(server.hits("token"), 2);
    }

    #[tokio::test]
    async fn test_rejected_credentials() {
        let server = FakeServer::start(|hits| {
            Router::new().route(
                "/tenant-1/oauth2/v2.0/token",
                post(move || {
                    hits.hit("token");
                    async {
                        (
                            axum::http::StatusCode::UNAUTHORIZED,
                            Json(json!({"error": "invalid_client"})),
                        )
                    }
                }),
            )
        })
        .await;

        let provider = ClientCredentialsProvider::new(reqwest::Client::new(), &config(&server.url()));
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, MeetingError::Auth(_)));
    }
}
