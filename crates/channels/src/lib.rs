//! Outbound delivery for flow stages.
//!
//! Gateway: resolves a recipient's destination and hands the message to the
//! provider registered for the channel (SendGrid email, Twilio SMS).
//! Gate: per-channel rate limiting and circuit breaking shared by all workers.

#![warn(clippy::unwrap_used)]

pub mod email;
pub mod gate;
pub mod gateway;
pub mod sms;

pub use email::SendGridSender;
pub use gate::{ChannelGate, ChannelGateState, GateDecision};
pub use gateway::{MessageSender, Outbound, SendGateway, TransportError};
pub use sms::TwilioSender;
