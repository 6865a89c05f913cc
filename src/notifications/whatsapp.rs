//! WhatsApp channel through the Twilio Messages API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{ChannelKind, NotificationChannel, RenderedMessage};
use crate::config::WhatsAppConfig;

pub struct WhatsAppChannel {
    config: WhatsAppConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct TwilioMessage {
    sid: String,
}

/// `whatsapp:+<digits>`; local Bangladeshi numbers (01XXXXXXXXX) get the +88 prefix
pub fn whatsapp_address(phone: &str) -> String {
    let phone = phone.trim().trim_start_matches("whatsapp:");
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if phone.starts_with('+') {
        format!("whatsapp:+{}", digits)
    } else if digits.len() == 11 && digits.starts_with("01") {
        format!("whatsapp:+88{}", digits)
    } else {
        format!("whatsapp:+{}", digits)
    }
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base_url.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

#[async_trait]
impl NotificationChannel for WhatsAppChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::WhatsApp
    }

    async fn send(&self, to: &str, message: &RenderedMessage) -> Result<()> {
        let params = [
            ("From", whatsapp_address(&self.config.from_number)),
            ("To", whatsapp_address(to)),
            ("Body", message.text.clone()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await
            .context("Failed to reach Twilio")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Twilio API error: {} - {}", status, body);
        }

        let sent: TwilioMessage = response
            .json()
            .await
            .context("Failed to parse Twilio response")?;
        tracing::info!(sid = %sent.sid, "WhatsApp message sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakeServer;
    use axum::{extract::Form, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_whatsapp_address() {
        assert_eq!(whatsapp_address("+8801712345678"), "whatsapp:+8801712345678");
        assert_eq!(whatsapp_address("01712345678"), "whatsapp:+8801712345678");
        assert_eq!(whatsapp_address("whatsapp:+14155238886"), "whatsapp:+14155238886");
        assert_eq!(whatsapp_address("+1 (415) 523-8886"), "whatsapp:+14155238886");
    }

    fn config(base: String) -> WhatsAppConfig {
        WhatsAppConfig {
            account_sid: "AC123".into(),
            auth_token: "secret".into(),
            from_number: "+14155238886".into(),
            api_base_url: base,
        }
    }

    fn text(body: &str) -> RenderedMessage {
        RenderedMessage {
            subject: String::new(),
            text: body.into(),
            html: None,
        }
    }

    #[tokio::test]
    async fn test_send_posts_form_to_twilio() {
        let server = FakeServer::start(|hits| {
            Router::new().route(
                "/2010-04-01/Accounts/AC123/Messages.json",
                post(move |Form(form): Form<HashMap<String, String>>| {
                    hits.hit("messages");
                    async move {
                        assert_eq!(form["To"], "whatsapp:+8801712345678");
                        assert_eq!(form["From"], "whatsapp:+14155238886");
                        (StatusCode::CREATED, Json(json!({"sid": "SM1", "body": form["Body"]})))
                    }
                }),
            )
        })
        .await;

        let channel = WhatsAppChannel::new(config(server.url()));
        channel.send("01712345678", &text("Reminder")).await.unwrap();
        assert_eq!(server.hits("messages"), 1);
    }

    #[tokio::test]
    async fn test_twilio_error_is_returned() {
        let server = FakeServer::start(|_| {
            Router::new().route(
                "/2010-04-01/Accounts/AC123/Messages.json",
                post(|| async { (StatusCode::BAD_REQUEST, Json(json!({"code": 21211}))) }),
            )
        })
        .await;

        let channel = WhatsAppChannel::new(config(server.url()));
        assert!(channel.send("+8801712345678", &text("x")).await.is_err());
    }
}
