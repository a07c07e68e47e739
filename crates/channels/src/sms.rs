//! Twilio SMS delivery with segment accounting and status callbacks.

use async_trait::async_trait;
use campaign_core::channels::{Channel, Engagement, SendReceipt};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::email::EngagementUpdate;
use crate::gateway::{MessageSender, Outbound, TransportError};

/// Twilio rejects bodies above this many segments.
const MAX_SEGMENTS: u32 = 10;

/// Configuration for the Twilio SMS provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub messaging_service_sid: Option<String>,
    pub status_callback_url: Option<String>,
}

/// Delivery status reported by Twilio's status callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SmsStatus {
    Queued,
    Sent,
    Delivered,
    Failed,
    Undelivered,
}

impl SmsStatus {
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "queued" => Some(SmsStatus::Queued),
            "sent" => Some(SmsStatus::Sent),
            "delivered" => Some(SmsStatus::Delivered),
            "failed" => Some(SmsStatus::Failed),
            "undelivered" => Some(SmsStatus::Undelivered),
            _ => None,
        }
    }
}

/// Where an accepted message came from, for routing callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SentRef {
    stage_run_id: Uuid,
    recipient_id: String,
}

/// Twilio SMS provider.
pub struct TwilioSender {
    config: TwilioConfig,
    /// provider message sid -> originating send.
    sent: DashMap<String, SentRef>,
}

impl TwilioSender {
    pub fn new(config: TwilioConfig) -> Self {
        info!(
            account_sid = %config.account_sid,
            from = %config.from_number,
            "Twilio SMS provider initialized"
        );
        Self {
            config,
            sent: DashMap::new(),
        }
    }

    /// Number of SMS segments a body occupies.
    /// GSM 7-bit: 160 chars single, 153 per part when concatenated.
    /// UCS-2: 70 chars single, 67 per part.
    pub fn calculate_segments(body: &str) -> u32 {
        let chars = body.chars().count() as u32;
        let (single, part) = if body.chars().all(is_gsm_7bit) {
            (160, 153)
        } else {
            (70, 67)
        };
        if chars <= single {
            1
        } else {
            chars.div_ceil(part)
        }
    }

    /// Maps a status callback to an engagement update. Only terminal
    /// non-delivery counts as engagement (a bounce); SMS has no opens.
    pub fn engagement_from_callback(
        &self,
        message_sid: &str,
        status: &str,
    ) -> Option<EngagementUpdate> {
        let Some(parsed) = SmsStatus::parse(status) else {
            warn!(status = %status, "Unknown SMS status in callback");
            return None;
        };
        metrics::counter!("sms.status_callbacks", "status" => status.to_string()).increment(1);

        if !matches!(parsed, SmsStatus::Failed | SmsStatus::Undelivered) {
            return None;
        }
        let Some(origin) = self.sent.get(message_sid).map(|r| r.clone()) else {
            warn!(message_sid = %message_sid, "Status callback for unknown message");
            return None;
        };
        Some(EngagementUpdate {
            stage_run_id: origin.stage_run_id,
            recipient_id: origin.recipient_id,
            engagement: Engagement::Bounced,
        })
    }

    pub fn config(&self) -> &TwilioConfig {
        &self.config
    }
}

#[async_trait]
impl MessageSender for TwilioSender {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    fn provider_name(&self) -> &str {
        "twilio"
    }

    /// In production: POST to /2010-04-01/Accounts/{sid}/Messages.json
    async fn send(&self, message: &Outbound<'_>) -> Result<SendReceipt, TransportError> {
        if !message.destination.starts_with('+') {
            return Err(TransportError::Rejected(format!(
                "destination {} is not E.164",
                message.destination
            )));
        }
        let segments = Self::calculate_segments(&message.content.body);
        if segments > MAX_SEGMENTS {
            return Err(TransportError::Rejected(format!(
                "body needs {segments} segments, limit is {MAX_SEGMENTS}"
            )));
        }

        let sid = format!("SM{}", Uuid::new_v4().simple());
        self.sent.insert(
            sid.clone(),
            SentRef {
                stage_run_id: message.stage_run_id,
                recipient_id: message.recipient.id.clone(),
            },
        );

        debug!(
            recipient_id = %message.recipient.id,
            to = %message.destination,
            message_sid = %sid,
            segments,
            "SMS queued with Twilio"
        );
        metrics::counter!("sms.messages_sent").increment(1);
        metrics::counter!("sms.segments_sent").increment(segments as u64);

        Ok(SendReceipt {
            channel: Channel::Sms,
            provider_message_id: sid,
        })
    }
}

/// GSM 03.38 default alphabet plus the extension table.
fn is_gsm_7bit(c: char) -> bool {
    matches!(c,
        'A'..='Z' | 'a'..='z' | '0'..='9'
        | ' ' | '!' | '"' | '#' | '$' | '%' | '&' | '\'' | '(' | ')'
        | '*' | '+' | ',' | '-' | '.' | '/' | ':' | ';' | '<' | '='
        | '>' | '?' | '@' | '_' | '\n' | '\r'
        | '£' | '¥' | 'è' | 'é' | 'ù' | 'ì' | 'ò' | 'Ç' | 'Ø' | 'ø' | 'Å' | 'å'
        | 'Δ' | 'Φ' | 'Γ' | 'Λ' | 'Ω' | 'Π' | 'Ψ' | 'Σ' | 'Θ' | 'Ξ'
        | 'Æ' | 'æ' | 'ß' | 'É' | '¤' | '¡' | '¿' | 'Ä' | 'Ö' | 'Ñ' | 'Ü' | '§'
        | 'ä' | 'ö' | 'ñ' | 'ü' | 'à'
        | '{' | '}' | '[' | ']' | '~' | '\\' | '^' | '|' | '€'
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use campaign_core::channels::{MessageContent, Recipient};

    fn sender() -> TwilioSender {
        TwilioSender::new(TwilioConfig {
            account_sid: "AC_test".into(),
            auth_token: "token".into(),
            from_number: "+15551234567".into(),
            messaging_service_sid: None,
            status_callback_url: None,
        })
    }

    fn text(body: &str) -> MessageContent {
        MessageContent {
            subject: None,
            body: body.into(),
            is_html: false,
        }
    }

    #[test]
    fn test_segments() {
        assert_eq!(TwilioSender::calculate_segments(""), 1);
        assert_eq!(TwilioSender::calculate_segments(&"A".repeat(160)), 1);
        assert_eq!(TwilioSender::calculate_segments(&"A".repeat(161)), 2);
        assert_eq!(TwilioSender::calculate_segments(&"B".repeat(307)), 3);
        let unicode = format!("{}\u{1F600}", "A".repeat(70));
        assert_eq!(TwilioSender::calculate_segments(&unicode), 2);
    }

    #[tokio::test]
    async fn test_failed_callback_becomes_bounce() {
        let sender = sender();
        let recipient = Recipient {
            id: "r-4".into(),
            email: None,
            phone: Some("+15559876543".into()),
        };
        let content = text("Your code is ready");
        let stage_run_id = Uuid::new_v4();
        let receipt = sender
            .send(&Outbound {
                stage_run_id,
                destination: "+15559876543",
                recipient: &recipient,
                content: &content,
            })
            .await
            .unwrap();
        assert!(receipt.provider_message_id.starts_with("SM"));

        assert!(sender
            .engagement_from_callback(&receipt.provider_message_id, "delivered")
            .is_none());
        let update = sender
            .engagement_from_callback(&receipt.provider_message_id, "undelivered")
            .unwrap();
        assert_eq!(update.engagement, Engagement::Bounced);
        assert_eq!(update.stage_run_id, stage_run_id);
        assert_eq!(update.recipient_id, "r-4");

        assert!(sender.engagement_from_callback("SM_unknown", "failed").is_none());
    }

    #[tokio::test]
    async fn test_rejects_non_e164_and_oversized() {
        let sender = sender();
        let recipient = Recipient {
            id: "r-5".into(),
            email: None,
            phone: Some("5550100".into()),
        };
        let content = text("hi");
        let err = sender
            .send(&Outbound {
                stage_run_id: Uuid::new_v4(),
                destination: "5550100",
                recipient: &recipient,
                content: &content,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Rejected(_)));

        let long = text(&"x".repeat(153 * 11));
        let err = sender
            .send(&Outbound {
                stage_run_id: Uuid::new_v4(),
                destination: "+15550100",
                recipient: &recipient,
                content: &long,
            })
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
