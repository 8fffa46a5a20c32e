use std::collections::HashMap;
use std::time::Duration;

use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use serde_json::{json, Value};

use crate::packs::NotificationPolicies;

// key: notifications -> channel-dispatch
//
// Fans a message out to every channel in the tenant's notification policy.
// Webhook URLs and SMTP settings come from the policy, not the environment.

const DEFAULT_SENDER: &str = "noreply@resolvd.local";

#[derive(Debug, Clone, Serialize)]
pub struct ChannelResult {
    pub sent: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct NotificationResult {
    pub success: bool,
    pub channels: HashMap<String, ChannelResult>,
}

pub struct NotificationService {
    http: reqwest::Client,
}

impl NotificationService {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("notification client build"),
        }
    }

    pub async fn send(
        &self,
        tenant_id: &str,
        group: &str,
        subject: &str,
        message: &str,
        payload_link: Option<&str>,
        policy: &NotificationPolicies,
    ) -> NotificationResult {
        let mut result = NotificationResult::default();
        let recipients = policy
            .recipients_by_group
            .get(group)
            .cloned()
            .unwrap_or_default();

        if recipients.is_empty() && policy.webhook_urls.is_empty() {
            tracing::warn!(%tenant_id, %group, "no recipients or webhooks configured");
            return result;
        }

        if policy.channels.iter().any(|channel| channel == "email") && !recipients.is_empty() {
            let outcome = self
                .send_email(&recipients, subject, message, payload_link, policy)
                .await;
            result.channels.insert("email".to_string(), outcome);
        }

        for channel in &policy.channels {
            if !matches!(channel.as_str(), "teamsWebhook" | "slackWebhook" | "webhook") {
                continue;
            }
            let Some(url) = policy.webhook_urls.get(channel) else {
                continue;
            };
            let outcome = self
                .send_webhook(url, subject, message, payload_link, channel)
                .await;
            result.channels.insert(channel.clone(), outcome);
        }

        result.success = result.channels.values().any(|channel| channel.sent);
        result
    }

    async fn send_email(
        &self,
        recipients: &[String],
        subject: &str,
        message: &str,
        payload_link: Option<&str>,
        policy: &NotificationPolicies,
    ) -> ChannelResult {
        let Some(smtp) = &policy.smtp_config else {
            return ChannelResult {
                sent: false,
                error: Some("SMTP host not configured".to_string()),
            };
        };

        let mut body = message.to_string();
        if let Some(link) = payload_link {
            body.push_str(&format!("\n\nView details: {link}"));
        }

        let from: Mailbox = match smtp
            .user
            .clone()
            .unwrap_or_else(|| DEFAULT_SENDER.to_string())
            .parse()
        {
            Ok(mailbox) => mailbox,
            Err(err) => {
                return ChannelResult {
                    sent: false,
                    error: Some(format!("invalid sender address: {err}")),
                }
            }
        };

        let mut builder = Message::builder().from(from).subject(subject);
        for recipient in recipients {
            match recipient.parse::<Mailbox>() {
                Ok(mailbox) => builder = builder.to(mailbox),
                Err(err) => {
                    tracing::warn!(%recipient, ?err, "skipping invalid recipient");
                }
            }
        }
        let email = match builder.body(body) {
            Ok(email) => email,
            Err(err) => {
                return ChannelResult {
                    sent: false,
                    error: Some(format!("failed to build email: {err}")),
                }
            }
        };

        let mut transport =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp.host.as_str())
                .port(smtp.port);
        if smtp.use_tls {
            match TlsParameters::new(smtp.host.clone()) {
                Ok(params) => transport = transport.tls(Tls::Opportunistic(params)),
                Err(err) => {
                    return ChannelResult {
                        sent: false,
                        error: Some(format!("failed to build TLS parameters: {err}")),
                    }
                }
            }
        }
        if let (Some(user), Some(password)) = (&smtp.user, &smtp.password) {
            transport = transport.credentials(Credentials::new(user.clone(), password.clone()));
        }
        let mailer = transport.build();

        match mailer.send(email).await {
            Ok(_) => {
                tracing::info!(recipients = recipients.len(), "email notification sent");
                ChannelResult {
                    sent: true,
                    error: None,
                }
            }
            Err(err) => {
                tracing::error!(?err, "failed to send email notification");
                ChannelResult {
                    sent: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn send_webhook(
        &self,
        url: &str,
        subject: &str,
        message: &str,
        payload_link: Option<&str>,
        channel_type: &str,
    ) -> ChannelResult {
        let payload = format_webhook_payload(subject, message, payload_link, channel_type);
        let outcome = self
            .http
            .post(url)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        match outcome {
            Ok(_) => {
                tracing::info!(%channel_type, "webhook notification sent");
                ChannelResult {
                    sent: true,
                    error: None,
                }
            }
            Err(err) => {
                tracing::error!(?err, %channel_type, "failed to send webhook notification");
                ChannelResult {
                    sent: false,
                    error: Some(err.to_string()),
                }
            }
        }
    }
}

impl Default for NotificationService {
    fn default() -> Self {
        Self::new()
    }
}

fn format_webhook_payload(
    subject: &str,
    message: &str,
    payload_link: Option<&str>,
    channel_type: &str,
) -> Value {
    match channel_type {
        "slackWebhook" => {
            let mut blocks = vec![json!({
                "type": "section",
                "text": {"type": "mrkdwn", "text": format!("*{subject}*\n\n{message}")},
            })];
            if let Some(link) = payload_link {
                blocks.push(json!({
                    "type": "section",
                    "text": {"type": "mrkdwn", "text": format!("<{link}|View Details>")},
                }));
            }
            json!({"text": subject, "blocks": blocks})
        }
        "teamsWebhook" => {
            let mut card = json!({
                "@type": "MessageCard",
                "@context": "https://schema.org/extensions",
                "summary": subject,
                "themeColor": "0078D4",
                "title": subject,
                "text": message,
            });
            if let Some(link) = payload_link {
                card["potentialAction"] = json!([{
                    "@type": "OpenUri",
                    "name": "View Details",
                    "targets": [{"os": "default", "uri": link}],
                }]);
            }
            card
        }
        _ => {
            let mut payload = json!({"subject": subject, "message": message});
            if let Some(link) = payload_link {
                payload["link"] = json!(link);
            }
            payload
        }
    }
}
