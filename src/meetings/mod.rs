//! Online meeting integration.
//!
//! A [`MeetingProvider`] creates, updates and cancels the external meeting
//! behind a class session. Providers are looked up per [`Platform`] through
//! [`MeetingProviders`], which is also the boundary where provider errors are
//! logged and flattened into `Option`/`bool` for the scheduling side.

pub mod teams;
pub mod token;
pub mod whatsapp;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::validation::is_valid_email;
use crate::config::MeetingsConfig;
use crate::db::Platform;

pub use teams::TeamsMeetingClient;
pub use token::{AccessTokenProvider, ClientCredentialsProvider};
pub use whatsapp::click_to_chat_link;

#[derive(Debug, thiserror::Error)]
pub enum MeetingError {
    #[error("identity provider authentication failed: {0}")]
    Auth(String),

    #[error("invalid meeting request: {0}")]
    InvalidRequest(String),

    #[error("meeting provider unreachable: {0}")]
    Transport(String),

    #[error("meeting provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("unexpected meeting provider response: {0}")]
    InvalidResponse(String),

    #[error("meeting provider misconfigured: {0}")]
    Configuration(String),

    #[error("no meeting provider configured for {0}")]
    NotConfigured(Platform),
}

impl MeetingError {
    /// Transport failures, throttling, expired tokens and server errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Provider { status, .. } => *status == 401 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Attendee {
    pub email: String,
    pub name: Option<String>,
}

impl Attendee {
    pub fn new(email: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email: email.into(),
            name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MeetingRequest {
    pub subject: String,
    /// HTML body shown in the calendar invite
    pub body: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    pub attendees: Vec<Attendee>,
    /// Stable per session; lets the provider collapse a replayed create
    pub transaction_id: Option<String>,
}

impl MeetingRequest {
    /// Checked before any network call
    pub fn validate(&self) -> Result<(), MeetingError> {
        if self.end <= self.start {
            return Err(MeetingError::InvalidRequest(
                "meeting end must be after its start".to_string(),
            ));
        }
        validate_attendees(&self.attendees)
    }
}

/// Partial update; `None` fields are left untouched on the provider side
#[derive(Debug, Clone, Default)]
pub struct MeetingUpdate {
    pub subject: Option<String>,
    pub start: Option<DateTime<FixedOffset>>,
    pub end: Option<DateTime<FixedOffset>>,
    pub attendees: Option<Vec<Attendee>>,
}

impl MeetingUpdate {
    pub fn is_empty(&self) -> bool {
        self.subject.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.attendees.is_none()
    }

    pub fn validate(&self) -> Result<(), MeetingError> {
        if self.is_empty() {
            return Err(MeetingError::InvalidRequest("nothing to update".to_string()));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end <= start {
                return Err(MeetingError::InvalidRequest(
                    "meeting end must be after its start".to_string(),
                ));
            }
        }
        if let Some(attendees) = &self.attendees {
            validate_attendees(attendees)?;
        }
        Ok(())
    }
}

fn validate_attendees(attendees: &[Attendee]) -> Result<(), MeetingError> {
    if attendees.is_empty() {
        return Err(MeetingError::InvalidRequest(
            "at least one attendee is required".to_string(),
        ));
    }
    if let Some(bad) = attendees.iter().find(|a| !is_valid_email(&a.email)) {
        return Err(MeetingError::InvalidRequest(format!(
            "invalid attendee address: {}",
            bad.email
        )));
    }
    Ok(())
}

/// The created meeting. Only `id` and `join_url` are kept, on the session row.
#[derive(Debug, Clone, Serialize)]
pub struct MeetingDetails {
    pub id: String,
    pub join_url: String,
    pub subject: String,
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

#[async_trait]
pub trait MeetingProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_meeting(&self, request: &MeetingRequest)
        -> Result<MeetingDetails, MeetingError>;

    /// Last write wins
    async fn update_meeting(
        &self,
        meeting_id: &str,
        update: &MeetingUpdate,
    ) -> Result<(), MeetingError>;

    async fn cancel_meeting(&self, meeting_id: &str, reason: &str) -> Result<(), MeetingError>;
}

/// Meeting providers keyed by platform
#[derive(Clone, Default)]
pub struct MeetingProviders {
    providers: HashMap<Platform, Arc<dyn MeetingProvider>>,
}

impl MeetingProviders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, platform: Platform, provider: Arc<dyn MeetingProvider>) -> Self {
        self.providers.insert(platform, provider);
        self
    }

    /// Build the providers that have configuration. Teams without an organizer is an error.
    pub fn from_config(config: &MeetingsConfig) -> Result<Self, MeetingError> {
        let mut providers = Self::new();
        if let Some(teams) = &config.teams {
            let client = TeamsMeetingClient::new(teams)?;
            info!(organizer = %teams.organizer, "Microsoft Teams meetings enabled");
            providers = providers.with_provider(Platform::Teams, Arc::new(client));
        }
        Ok(providers)
    }

    pub fn supports(&self, platform: Platform) -> bool {
        self.providers.contains_key(&platform)
    }

    fn provider(&self, platform: Platform) -> Result<&Arc<dyn MeetingProvider>, MeetingError> {
        self.providers
            .get(&platform)
            .ok_or(MeetingError::NotConfigured(platform))
    }

    /// `None` means the meeting is not available yet; the cause is logged
    pub async fn create_meeting(
        &self,
        platform: Platform,
        request: &MeetingRequest,
    ) -> Option<MeetingDetails> {
        let result = match request.validate() {
            Ok(()) => match self.provider(platform) {
                Ok(provider) => provider.create_meeting(request).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(details) => {
                record("create", "success");
                info!(
                    platform = %platform,
                    meeting_id = %details.id,
                    "Meeting created"
                );
                Some(details)
            }
            Err(MeetingError::NotConfigured(platform)) => {
                record("create", "unsupported");
                debug!(platform = %platform, "No meeting provider configured");
                None
            }
            Err(e) => {
                record("create", "error");
                warn!(platform = %platform, error = %e, "Meeting creation failed");
                None
            }
        }
    }

    pub async fn update_meeting(
        &self,
        platform: Platform,
        meeting_id: &str,
        update: &MeetingUpdate,
    ) -> bool {
        let result = match update.validate() {
            Ok(()) => match self.provider(platform) {
                Ok(provider) => provider.update_meeting(meeting_id, update).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                record("update", "success");
                info!(platform = %platform, meeting_id = %meeting_id, "Meeting updated");
                true
            }
            Err(e) => {
                record("update", "error");
                warn!(platform = %platform, meeting_id = %meeting_id, error = %e, "Meeting update failed");
                false
            }
        }
    }

    pub async fn cancel_meeting(&self, platform: Platform, meeting_id: &str, reason: &str) -> bool {
        let result = match self.provider(platform) {
            Ok(provider) => provider.cancel_meeting(meeting_id, reason).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                record("cancel", "success");
                info!(platform = %platform, meeting_id = %meeting_id, "Meeting cancelled");
                true
            }
            Err(e) => {
                record("cancel", "error");
                warn!(platform = %platform, meeting_id = %meeting_id, error = %e, "Meeting cancellation failed");
                false
            }
        }
    }
}

fn record(operation: &'static str, outcome: &'static str) {
    metrics::counter!(
        "meeting_operations_total",
        "operation" => operation,
        "outcome" => outcome
    )
    .increment(1);
}
