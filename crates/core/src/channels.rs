//! Outreach channel types shared by the send gateway, the channel gate and
//! the flow engine.
//!
//! A flow stage addresses exactly one channel. Recipients carry the
//! destinations for every channel they can be reached on; a recipient without
//! a destination for the stage's channel never produces a send attempt.

use serde::{Deserialize, Serialize};

/// Identifier of a contact targeted by a flow.
pub type RecipientId = String;

// ─── Channels ───────────────────────────────────────────────────────────────

/// Delivery channels a send stage can target.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Sms,
}

impl Channel {
    pub fn display_name(&self) -> &'static str {
        match self {
            Channel::Email => "Email",
            Channel::Sms => "SMS",
        }
    }

    /// Stable lowercase key used in shared-state keys and metric labels.
    pub fn key(&self) -> &'static str {
        match self {
            Channel::Email => "email",
            Channel::Sms => "sms",
        }
    }

    pub fn all() -> [Channel; 2] {
        [Channel::Email, Channel::Sms]
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

// ─── Recipients ─────────────────────────────────────────────────────────────

/// An addressable contact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Recipient {
    pub id: RecipientId,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Recipient {
    /// Returns the destination for `channel`, ignoring blank values.
    pub fn destination(&self, channel: Channel) -> Option<&str> {
        let value = match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

// ─── Content ────────────────────────────────────────────────────────────────

/// Resolved message content for one stage. Resolved once per stage run and
/// reused for every recipient in it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageContent {
    pub subject: Option<String>,
    pub body: String,
    pub is_html: bool,
}

/// Engagement signals reported back by providers after delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Engagement {
    Opened,
    Clicked,
    Bounced,
}

/// Provider acknowledgement of an accepted message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SendReceipt {
    pub channel: Channel,
    pub provider_message_id: String,
}
