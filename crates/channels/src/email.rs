//! SendGrid email delivery with engagement webhooks.
//!
//! Sends carry the stage run and recipient ids as custom args so inbound
//! webhook events (open, click, bounce) can be routed back to the exact send
//! record they belong to.

use async_trait::async_trait;
use campaign_core::channels::{Channel, Engagement, SendReceipt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gateway::{MessageSender, Outbound, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGridConfig {
    pub api_key: String,
    pub from_email: String,
    pub from_name: String,
    pub click_tracking: bool,
    pub open_tracking: bool,
}

/// SendGrid webhook event types we consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailEventType {
    Processed,
    Delivered,
    Open,
    Click,
    Bounce,
    Dropped,
    SpamReport,
    Unsubscribe,
}

/// One entry of a SendGrid event webhook batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailWebhookEvent {
    pub email: String,
    pub event: EmailEventType,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub stage_run_id: Option<Uuid>,
    #[serde(default)]
    pub recipient_id: Option<String>,
}

/// Engagement routed to the send record identified by stage run + recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngagementUpdate {
    pub stage_run_id: Uuid,
    pub recipient_id: String,
    pub engagement: Engagement,
}

/// SendGrid email provider.
pub struct SendGridSender {
    config: SendGridConfig,
}

impl SendGridSender {
    pub fn new(config: SendGridConfig) -> Self {
        info!(
            from = %config.from_email,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "SendGrid provider initialized"
        );
        Self { config }
    }

    /// Build the v3 mail/send payload for one recipient.
    pub fn build_payload(&self, message: &Outbound<'_>) -> serde_json::Value {
        let content = message.content;
        let content_type = if content.is_html {
            "text/html"
        } else {
            "text/plain"
        };
        serde_json::json!({
            "personalizations": [{
                "to": [{"email": message.destination}],
                "custom_args": {
                    "stage_run_id": message.stage_run_id.to_string(),
                    "recipient_id": message.recipient.id,
                }
            }],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name
            },
            "subject": content.subject.clone().unwrap_or_default(),
            "content": [{
                "type": content_type,
                "value": content.body
            }],
            "tracking_settings": {
                "click_tracking": {"enable": self.config.click_tracking},
                "open_tracking": {"enable": self.config.open_tracking}
            }
        })
    }

    /// Map a webhook event to an engagement update. Events without routing
    /// args or without engagement meaning are ignored.
    pub fn engagement_from_webhook(event: &EmailWebhookEvent) -> Option<EngagementUpdate> {
        let engagement = match event.event {
            EmailEventType::Open => Engagement::Opened,
            EmailEventType::Click => Engagement::Clicked,
            EmailEventType::Bounce | EmailEventType::Dropped => Engagement::Bounced,
            _ => return None,
        };
        let (Some(stage_run_id), Some(recipient_id)) = (event.stage_run_id, &event.recipient_id)
        else {
            warn!(email = %event.email, "SendGrid webhook missing routing args, skipping");
            return None;
        };

        metrics::counter!(
            "sendgrid.webhook_events",
            "type" => format!("{:?}", event.event)
        )
        .increment(1);

        Some(EngagementUpdate {
            stage_run_id,
            recipient_id: recipient_id.clone(),
            engagement,
        })
    }

    pub fn config(&self) -> &SendGridConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSender for SendGridSender {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    fn provider_name(&self) -> &str {
        "sendgrid"
    }

    /// In production: POST to https://api.sendgrid.com/v3/mail/send
    async fn send(&self, message: &Outbound<'_>) -> Result<SendReceipt, TransportError> {
        if !message.destination.contains('@') {
            return Err(TransportError::Rejected(format!(
                "invalid email address {}",
                message.destination
            )));
        }
        let _payload = self.build_payload(message);

        debug!(
            recipient_id = %message.recipient.id,
            stage_run_id = %message.stage_run_id,
            to = %message.destination,
            "Sending email via SendGrid"
        );
        metrics::counter!("sendgrid.emails_sent").increment(1);

        Ok(SendReceipt {
            channel: Channel::Email,
            provider_message_id: format!("sg-{}", Uuid::new_v4()),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use campaign_core::channels::{MessageContent, Recipient};

    fn sender() -> SendGridSender {
        SendGridSender::new(SendGridConfig {
            api_key: "SG.test".into(),
            from_email: "news@example.com".into(),
            from_name: "Example".into(),
            click_tracking: true,
            open_tracking: true,
        })
    }

    fn recipient() -> Recipient {
        Recipient {
            id: "r-9".into(),
            email: Some("reader@example.com".into()),
            phone: None,
        }
    }

    #[test]
    fn test_payload_carries_recipient_and_content_type() {
        let content = MessageContent {
            subject: Some("Welcome".into()),
            body: "<p>hello</p>".into(),
            is_html: true,
        };
        let stage_run_id = Uuid::new_v4();
        let recipient = recipient();
        let payload = sender().build_payload(&Outbound {
            stage_run_id,
            destination: "reader@example.com",
            recipient: &recipient,
            content: &content,
        });
        assert_eq!(payload["subject"], "Welcome");
        assert_eq!(payload["content"][0]["type"], "text/html");
        let args = &payload["personalizations"][0]["custom_args"];
        assert_eq!(args["recipient_id"], "r-9");
        assert_eq!(args["stage_run_id"], stage_run_id.to_string());
    }

    #[tokio::test]
    async fn test_send_rejects_malformed_address() {
        let content = MessageContent {
            subject: None,
            body: "x".into(),
            is_html: false,
        };
        let recipient = recipient();
        let mut message = Outbound {
            stage_run_id: Uuid::new_v4(),
            destination: "not-an-address",
            recipient: &recipient,
            content: &content,
        };
        let err = sender().send(&message).await.unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));

        message.destination = "reader@example.com";
        let receipt = sender().send(&message).await.unwrap();
        assert!(receipt.provider_message_id.starts_with("sg-"));
    }

    #[test]
    fn test_webhook_routing() {
        let stage_run_id = Uuid::new_v4();
        let event = EmailWebhookEvent {
            email: "reader@example.com".into(),
            event: EmailEventType::Click,
            sg_message_id: None,
            stage_run_id: Some(stage_run_id),
            recipient_id: Some("r-9".into()),
        };
        let update = SendGridSender::engagement_from_webhook(&event).unwrap();
        assert_eq!(update.engagement, Engagement::Clicked);
        assert_eq!(update.stage_run_id, stage_run_id);

        let delivered = EmailWebhookEvent {
            event: EmailEventType::Delivered,
            ..event.clone()
        };
        assert!(SendGridSender::engagement_from_webhook(&delivered).is_none());

        let unrouted = EmailWebhookEvent {
            stage_run_id: None,
            ..event
        };
        assert!(SendGridSender::engagement_from_webhook(&unrouted).is_none());
    }
}
