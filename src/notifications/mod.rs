//! Notification dispatch over email and WhatsApp.
//!
//! Callers hand a [`NotificationEvent`] to [`NotificationService::notify`] and move on.
//! Every delivery attempt is written to `notification_log`; failures are logged,
//! never returned.

mod email;
mod messages;
pub mod preferences;
mod whatsapp;

pub use email::EmailChannel;
pub use messages::RenderedMessage;
pub use preferences::MessageCategory;
pub use whatsapp::{whatsapp_address, WhatsAppChannel};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NotificationsConfig;
use crate::db;
use crate::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Email,
    WhatsApp,
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::WhatsApp => write!(f, "whatsapp"),
        }
    }
}

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    /// `to` is an email address or a phone number depending on the channel
    async fn send(&self, to: &str, message: &RenderedMessage) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipient {
    /// Set for platform users; their preferences apply
    pub user_id: Option<String>,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Recipient {
    fn address(&self, kind: ChannelKind) -> Option<&str> {
        match kind {
            ChannelKind::Email => self.email.as_deref(),
            ChannelKind::WhatsApp => self.phone.as_deref(),
        }
        .filter(|a| !a.trim().is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct SessionNotice {
    pub session_id: String,
    pub course_title: String,
    pub student: Recipient,
    pub teacher: Recipient,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub platform: String,
    pub join_url: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PaymentNotice {
    pub payment_id: String,
    pub invoice_number: String,
    pub course_title: String,
    pub amount: String,
    pub gateway: String,
    pub payer: Recipient,
}

#[derive(Debug, Clone)]
pub struct AssessmentNotice {
    pub assessment_id: String,
    pub full_name: String,
    pub phone_number: String,
    pub email: Option<String>,
    pub preferred_course: Option<String>,
    pub preferred_date: Option<String>,
    pub preferred_time: Option<String>,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct ReportNotice {
    pub start_date: String,
    pub end_date: String,
    pub csv: String,
}

#[derive(Debug, Clone)]
pub enum NotificationEvent {
    SessionBooked(SessionNotice),
    SessionReminder(SessionNotice),
    SessionRescheduled(SessionNotice),
    SessionCancelled(SessionNotice),
    MeetingReady(SessionNotice),
    PaymentPaid(PaymentNotice),
    PaymentFailed(PaymentNotice),
    AssessmentSubmitted(AssessmentNotice),
    WeeklyReport(ReportNotice),
}

const EMAIL_ONLY: &[ChannelKind] = &[ChannelKind::Email];
const EMAIL_AND_WHATSAPP: &[ChannelKind] = &[ChannelKind::Email, ChannelKind::WhatsApp];

impl NotificationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionBooked(_) => "session_booked",
            Self::SessionReminder(_) => "session_reminder",
            Self::SessionRescheduled(_) => "session_rescheduled",
            Self::SessionCancelled(_) => "session_cancelled",
            Self::MeetingReady(_) => "meeting_ready",
            Self::PaymentPaid(_) => "payment_paid",
            Self::PaymentFailed(_) => "payment_failed",
            Self::AssessmentSubmitted(_) => "assessment_submitted",
            Self::WeeklyReport(_) => "weekly_report",
        }
    }

    /// None for messages to the school itself
    pub fn category(&self) -> Option<MessageCategory> {
        match self {
            Self::SessionReminder(_) => Some(MessageCategory::ClassReminder),
            Self::SessionBooked(_)
            | Self::SessionRescheduled(_)
            | Self::SessionCancelled(_)
            | Self::MeetingReady(_) => Some(MessageCategory::ClassUpdates),
            Self::PaymentPaid(_) | Self::PaymentFailed(_) => Some(MessageCategory::PaymentReceipt),
            Self::AssessmentSubmitted(_) | Self::WeeklyReport(_) => None,
        }
    }

    fn channels(&self) -> &'static [ChannelKind] {
        match self {
            Self::SessionBooked(_)
            | Self::SessionReminder(_)
            | Self::SessionRescheduled(_)
            | Self::SessionCancelled(_)
            | Self::AssessmentSubmitted(_) => EMAIL_AND_WHATSAPP,
            Self::MeetingReady(_)
            | Self::PaymentPaid(_)
            | Self::PaymentFailed(_)
            | Self::WeeklyReport(_) => EMAIL_ONLY,
        }
    }

    fn recipients(&self, admin: &Recipient) -> Vec<Recipient> {
        match self {
            Self::SessionBooked(n)
            | Self::SessionReminder(n)
            | Self::SessionRescheduled(n)
            | Self::SessionCancelled(n)
            | Self::MeetingReady(n) => vec![n.student.clone(), n.teacher.clone()],
            Self::PaymentPaid(n) | Self::PaymentFailed(n) => vec![n.payer.clone()],
            Self::AssessmentSubmitted(_) | Self::WeeklyReport(_) => vec![admin.clone()],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Recipient turned this kind of message off for the channel
    pub opted_out: usize,
}

pub struct NotificationService {
    db: DbPool,
    channels: Vec<Arc<dyn NotificationChannel>>,
    admin: Recipient,
}

impl NotificationService {
    pub fn new(db: DbPool, admin: Recipient) -> Self {
        Self {
            db,
            channels: Vec::new(),
            admin,
        }
    }

    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Service with every channel that has configuration
    pub fn from_config(db: DbPool, config: &NotificationsConfig) -> anyhow::Result<Self> {
        let admin = Recipient {
            user_id: None,
            name: "Admin".to_string(),
            email: config.admin_email.clone(),
            phone: config.admin_whatsapp.clone(),
        };
        let mut service = Self::new(db, admin);

        match &config.email {
            Some(email) => {
                service = service.with_channel(Arc::new(EmailChannel::new(email.clone())?));
                info!(smtp_host = %email.smtp_host, "Email notifications enabled");
            }
            None => debug!("Email notifications not configured"),
        }
        match &config.whatsapp {
            Some(whatsapp) => {
                service = service.with_channel(Arc::new(WhatsAppChannel::new(whatsapp.clone())));
                info!("WhatsApp notifications enabled");
            }
            None => debug!("WhatsApp notifications not configured"),
        }

        Ok(service)
    }

    fn channel(&self, kind: ChannelKind) -> Option<&Arc<dyn NotificationChannel>> {
        self.channels.iter().find(|c| c.kind() == kind)
    }

    /// Deliver an event to all its recipients. Never fails.
    pub async fn dispatch(&self, event: &NotificationEvent) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        for recipient in event.recipients(&self.admin) {
            let preferences = self.preferences_for(event, &recipient).await;

            for &kind in event.channels() {
                let Some(address) = recipient.address(kind) else {
                    continue;
                };
                if let (Some(category), Some(prefs)) = (event.category(), &preferences) {
                    if !prefs.allows(category, kind) {
                        debug!(event = event.kind(), channel = %kind, user_id = %prefs.user_id, "Recipient opted out");
                        summary.opted_out += 1;
                        continue;
                    }
                }
                let Some(channel) = self.channel(kind) else {
                    debug!(event = event.kind(), channel = %kind, "Channel not configured, skipping");
                    summary.skipped += 1;
                    continue;
                };

                let message = messages::render(event, &recipient, kind);
                let result = channel.send(address, &message).await;
                let error = result.as_ref().err().map(|e| e.to_string());

                match &error {
                    None => {
                        summary.delivered += 1;
                        debug!(event = event.kind(), channel = %kind, to = %address, "Notification sent");
                    }
                    Some(e) => {
                        summary.failed += 1;
                        warn!(event = event.kind(), channel = %kind, to = %address, error = %e, "Notification failed");
                    }
                }

                metrics::counter!(
                    "notifications_sent_total",
                    "channel" => kind.to_string(),
                    "outcome" => if error.is_none() { "success" } else { "error" }
                )
                .increment(1);

                self.log_delivery(event.kind(), kind, address, error.as_deref())
                    .await;
            }
        }

        summary
    }

    /// Unreadable preferences fall back to sending
    async fn preferences_for(
        &self,
        event: &NotificationEvent,
        recipient: &Recipient,
    ) -> Option<db::NotificationPreferences> {
        event.category()?;
        let user_id = recipient.user_id.as_deref()?;
        match preferences::load(&self.db, user_id).await {
            Ok(prefs) => Some(prefs),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Cannot load notification preferences");
                None
            }
        }
    }

    /// Fire-and-forget dispatch on a background task
    pub fn notify(self: &Arc<Self>, event: NotificationEvent) -> JoinHandle<DispatchSummary> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.dispatch(&event).await })
    }

    async fn log_delivery(&self, event: &str, kind: ChannelKind, recipient: &str, error: Option<&str>) {
        let result = sqlx::query(
            r#"
            INSERT INTO notification_log (event, channel, recipient, success, error, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event)
        .bind(kind.to_string())
        .bind(recipient)
        .bind(error.is_none() as i32)
        .bind(error)
        .bind(db::timestamp())
        .execute(&self.db)
        .await;

        if let Err(e) = result {
            warn!(error = %e, "Failed to record notification delivery");
        }
    }
}
