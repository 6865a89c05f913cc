//! Microsoft Teams meetings through Microsoft Graph calendar events.
//!
//! Events are created on the organizer's calendar with `isOnlineMeeting` set, which
//! makes Graph attach a Teams meeting and return its join URL.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::token::{AccessTokenProvider, ClientCredentialsProvider};
use super::{Attendee, MeetingDetails, MeetingError, MeetingProvider, MeetingRequest, MeetingUpdate};
use crate::config::TeamsConfig;

pub struct TeamsMeetingClient {
    client: reqwest::Client,
    tokens: Arc<dyn AccessTokenProvider>,
    graph_base_url: String,
    organizer: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphEvent {
    id: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    web_link: Option<String>,
    #[serde(default)]
    online_meeting: Option<GraphOnlineMeeting>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphOnlineMeeting {
    #[serde(default)]
    join_url: Option<String>,
}

impl TeamsMeetingClient {
    /// Client with its own client-credentials token cache
    pub fn new(config: &TeamsConfig) -> Result<Self, MeetingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| MeetingError::Configuration(format!("HTTP client: {}", e)))?;
        let tokens = Arc::new(ClientCredentialsProvider::new(client.clone(), config));
        Self::with_token_provider(client, tokens, config)
    }

    pub fn with_token_provider(
        client: reqwest::Client,
        tokens: Arc<dyn AccessTokenProvider>,
        config: &TeamsConfig,
    ) -> Result<Self, MeetingError> {
        let organizer = config.organizer.trim();
        if organizer.is_empty() {
            return Err(MeetingError::Configuration(
                "meetings.teams.organizer must name the calendar owner".to_string(),
            ));
        }

        Ok(Self {
            client,
            tokens,
            graph_base_url: config.graph_base_url.trim_end_matches('/').to_string(),
            organizer: organizer.to_string(),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    fn events_url(&self) -> String {
        format!("{}/users/{}/events", self.graph_base_url, self.organizer)
    }

    fn event_url(&self, meeting_id: &str) -> String {
        format!("{}/{}", self.events_url(), meeting_id)
    }

    /// Send with bounded exponential backoff. Token failures abort immediately.
    /// Without `replay_safe`, a transport error is final: the request may already
    /// have landed.
    async fn send_with_retry<F>(
        &self,
        operation: &str,
        replay_safe: bool,
        build: F,
    ) -> Result<reqwest::Response, MeetingError>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        loop {
            let token = self.tokens.access_token().await?;

            let err = match build(&token).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::UNAUTHORIZED {
                        self.tokens.invalidate().await;
                    }
                    let body = response.text().await.unwrap_or_default();
                    MeetingError::Provider {
                        status: status.as_u16(),
                        body,
                    }
                }
                Err(e) => MeetingError::Transport(e.to_string()),
            };

            let in_doubt = matches!(err, MeetingError::Transport(_)) && !replay_safe;
            if attempt >= self.max_retries || !err.is_retryable() || in_doubt {
                return Err(err);
            }

            let delay = self.retry_base_delay * 2u32.saturating_pow(attempt);
            attempt += 1;
            warn!(
                operation = operation,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Graph request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn graph_time(dt: &DateTime<FixedOffset>) -> Value {
    json!({
        "dateTime": dt.with_timezone(&Utc).format("%Y-%m-%dT%H:%M:%S").to_string(),
        "timeZone": "UTC",
    })
}

fn graph_attendees(attendees: &[Attendee]) -> Value {
    Value::Array(
        attendees
            .iter()
            .map(|a| {
                json!({
                    "emailAddress": {
                        "address": a.email,
                        "name": a.name.clone().unwrap_or_else(|| a.email.clone()),
                    },
                    "type": "required",
                })
            })
            .collect(),
    )
}

fn create_payload(request: &MeetingRequest) -> Value {
    let mut payload = json!({
        "subject": request.subject,
        "body": { "contentType": "HTML", "content": request.body },
        "start": graph_time(&request.start),
        "end": graph_time(&request.end),
        "attendees": graph_attendees(&request.attendees),
        "isOnlineMeeting": true,
        "onlineMeetingProvider": "teamsForBusiness",
        "allowNewTimeProposals": false,
    });
    // Graph returns the existing event when a create is replayed with the same id
    if let Some(transaction_id) = &request.transaction_id {
        payload["transactionId"] = json!(transaction_id);
    }
    payload
}

fn update_payload(update: &MeetingUpdate) -> Value {
    let mut body = Map::new();
    if let Some(subject) = &update.subject {
        body.insert("subject".into(), json!(subject));
    }
    if let Some(start) = &update.start {
        body.insert("start".into(), graph_time(start));
    }
    if let Some(end) = &update.end {
        body.insert("end".into(), graph_time(end));
    }
    if let Some(attendees) = &update.attendees {
        body.insert("attendees".into(), graph_attendees(attendees));
    }
    Value::Object(body)
}

#[async_trait]
impl MeetingProvider for TeamsMeetingClient {
    fn name(&self) -> &'static str {
        "teams"
    }

    async fn create_meeting(&self, request: &MeetingRequest) -> Result<MeetingDetails, MeetingError> {
        request.validate()?;

        let url = self.events_url();
        let payload = create_payload(request);
        let response = self
            .send_with_retry("create", request.transaction_id.is_some(), |token| {
                self.client
                    .post(&url)
                    .bearer_auth(token)
                    .header("Prefer", "outlook.timezone=\"UTC\"")
                    .json(&payload)
            })
            .await?;

        let event: GraphEvent = response
            .json()
            .await
            .map_err(|e| MeetingError::InvalidResponse(e.to_string()))?;

        let join_url = event
            .online_meeting
            .and_then(|m| m.join_url)
            .or(event.web_link)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                MeetingError::InvalidResponse(format!("event {} has no join URL", event.id))
            })?;

        debug!(meeting_id = %event.id, "Graph event created");

        Ok(MeetingDetails {
            id: event.id,
            join_url,
            subject: event.subject.unwrap_or_else(|| request.subject.clone()),
            start: request.start,
            end: request.end,
        })
    }

    async fn update_meeting(&self, meeting_id: &str, update: &MeetingUpdate) -> Result<(), MeetingError> {
        update.validate()?;

        let url = self.event_url(meeting_id);
        let payload = update_payload(update);
        self.send_with_retry("update", true, |token| {
            self.client.patch(&url).bearer_auth(token).json(&payload)
        })
        .await?;
        Ok(())
    }

    async fn cancel_meeting(&self, meeting_id: &str, reason: &str) -> Result<(), MeetingError> {
        let url = format!("{}/cancel", self.event_url(meeting_id));
        let payload = json!({ "comment": reason });
        self.send_with_retry("cancel", true, |token| {
            self.client.post(&url).bearer_auth(token).json(&payload)
        })
        .await?;
        Ok(())
    }
}
