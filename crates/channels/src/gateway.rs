//! Send gateway — the per-recipient send primitive used by flow workers.
//!
//! Looks up the provider registered for the stage's channel, resolves the
//! recipient's destination on that channel and enforces the send timeout.
//! Rate limiting and circuit breaking happen before this, in the gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use campaign_core::channels::{Channel, MessageContent, Recipient, SendReceipt};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Failures reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transient transport failure: {0}")]
    Transient(String),

    #[error("send timed out after {0} ms")]
    Timeout(u64),

    #[error("recipient has no {0} destination")]
    MissingDestination(Channel),

    #[error("provider rejected message: {0}")]
    Rejected(String),

    #[error("no provider registered for channel {0}")]
    ChannelUnavailable(Channel),
}

impl TransportError {
    /// Retrying may succeed; anything else is final for this recipient.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_) | TransportError::Timeout(_))
    }

    /// Whether the failure reflects provider health and should count against
    /// the channel's circuit breaker.
    pub fn counts_against_channel(&self) -> bool {
        matches!(self, TransportError::Transient(_) | TransportError::Timeout(_))
    }
}

/// One message addressed to one recipient within one stage run.
#[derive(Debug, Clone, Copy)]
pub struct Outbound<'a> {
    pub stage_run_id: Uuid,
    pub destination: &'a str,
    pub recipient: &'a Recipient,
    pub content: &'a MessageContent,
}

/// A delivery provider for one channel.
#[async_trait]
pub trait MessageSender: Send + Sync {
    fn channel(&self) -> Channel;

    /// The name of the underlying provider (for metrics/logging).
    fn provider_name(&self) -> &str;

    async fn send(&self, message: &Outbound<'_>) -> Result<SendReceipt, TransportError>;
}

/// Routes a send to the provider registered for its channel.
pub struct SendGateway {
    senders: HashMap<Channel, Arc<dyn MessageSender>>,
    send_timeout: Duration,
}

impl std::fmt::Debug for SendGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendGateway")
            .field("channels", &self.senders.keys().collect::<Vec<_>>())
            .field("send_timeout", &self.send_timeout)
            .finish()
    }
}

impl SendGateway {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            senders: HashMap::new(),
            send_timeout,
        }
    }

    /// Registers `sender` for its channel, replacing any previous provider.
    pub fn with_sender(mut self, sender: Arc<dyn MessageSender>) -> Self {
        info!(
            channel = %sender.channel(),
            provider = sender.provider_name(),
            "Registered message sender"
        );
        self.senders.insert(sender.channel(), sender);
        self
    }

    pub fn supports(&self, channel: Channel) -> bool {
        self.senders.contains_key(&channel)
    }

    /// Delivers one message to one recipient.
    pub async fn send(
        &self,
        channel: Channel,
        stage_run_id: Uuid,
        recipient: &Recipient,
        content: &MessageContent,
    ) -> Result<SendReceipt, TransportError> {
        let sender = self
            .senders
            .get(&channel)
            .ok_or(TransportError::ChannelUnavailable(channel))?;
        let destination = recipient
            .destination(channel)
            .ok_or(TransportError::MissingDestination(channel))?;

        debug!(
            recipient_id = %recipient.id,
            channel = %channel,
            provider = sender.provider_name(),
            "Sending message"
        );

        let message = Outbound {
            stage_run_id,
            destination,
            recipient,
            content,
        };
        let start = Instant::now();
        let result = match tokio::time::timeout(self.send_timeout, sender.send(&message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.send_timeout.as_millis() as u64)),
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        metrics::histogram!("flow.send_latency_ms", "channel" => channel.key())
            .record(latency_ms as f64);

        match &result {
            Ok(receipt) => {
                metrics::counter!("flow.sends", "channel" => channel.key(), "outcome" => "sent")
                    .increment(1);
                debug!(
                    recipient_id = %recipient.id,
                    provider_message_id = %receipt.provider_message_id,
                    latency_ms,
                    "Message accepted by provider"
                );
            }
            Err(err) => {
                metrics::counter!("flow.sends", "channel" => channel.key(), "outcome" => "failed")
                    .increment(1);
                warn!(
                    recipient_id = %recipient.id,
                    channel = %channel,
                    error = %err,
                    "Message send failed"
                );
            }
        }
        result
    }
}
