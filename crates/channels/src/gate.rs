//! Channel gate — per-channel rate limiter and circuit breaker.
//!
//! All state lives in a shared [`CounterStore`] because workers are separate
//! processes. Each check is a single atomic store operation; the gate never
//! reads a counter, decides, and writes it back.
//!
//! Keys per channel:
//! - `{channel}:rate`      fixed-window send counter, expires with the window
//! - `{channel}:failures`  failure counter over the failure window
//! - `{channel}:circuit`   present while the circuit is open, TTL = cooldown

use std::sync::Arc;
use std::time::Duration;

use campaign_cache::CounterStore;
use campaign_core::channels::Channel;
use campaign_core::config::GateConfig;
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::EventType;
use campaign_core::CampaignResult;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Outcome of asking the gate for a send slot. Deferrals are scheduling
/// signals: the caller requeues the task after `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allowed,
    RateLimited { retry_after: Duration },
    CircuitOpen { retry_after: Duration },
}

impl GateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, GateDecision::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GateDecision::Allowed => None,
            GateDecision::RateLimited { retry_after } | GateDecision::CircuitOpen { retry_after } => {
                Some(*retry_after)
            }
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            GateDecision::Allowed => "allowed",
            GateDecision::RateLimited { .. } => "rate_limited",
            GateDecision::CircuitOpen { .. } => "circuit_open",
        }
    }
}

/// Snapshot of one channel's gate counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelGateState {
    pub channel: Channel,
    pub window_sends: u64,
    pub limit: u64,
    pub failures: u64,
    pub circuit_open: bool,
    pub circuit_retry_after_ms: Option<u64>,
}

pub struct ChannelGate {
    store: Arc<dyn CounterStore>,
    config: GateConfig,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for ChannelGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelGate")
            .field("config", &self.config)
            .finish()
    }
}

fn rate_key(channel: Channel) -> String {
    format!("{}:rate", channel.key())
}

fn failures_key(channel: Channel) -> String {
    format!("{}:failures", channel.key())
}

fn circuit_key(channel: Channel) -> String {
    format!("{}:circuit", channel.key())
}

impl ChannelGate {
    pub fn new(store: Arc<dyn CounterStore>, config: GateConfig) -> Self {
        info!(
            email_per_window = config.email_per_window,
            sms_per_window = config.sms_per_window,
            window_secs = config.window_secs,
            failure_threshold = config.failure_threshold,
            "Channel gate initialized"
        );
        Self {
            store,
            config,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn limit_for(&self, channel: Channel) -> u64 {
        match channel {
            Channel::Email => self.config.email_per_window,
            Channel::Sms => self.config.sms_per_window,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs.max(1))
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.cooldown_secs.max(1))
    }

    fn jitter(&self) -> Duration {
        if self.config.max_jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=self.config.max_jitter_ms))
    }

    /// Claims a send slot on `channel`. The circuit is checked first so an
    /// open circuit never consumes rate budget.
    pub async fn acquire(&self, channel: Channel) -> CampaignResult<GateDecision> {
        let decision = self.decide(channel).await?;
        if !decision.is_allowed() {
            metrics::counter!(
                "gate.deferred",
                "channel" => channel.key(),
                "reason" => decision.reason()
            )
            .increment(1);
            debug!(
                channel = %channel,
                reason = decision.reason(),
                retry_after_ms = decision.retry_after().map(|d| d.as_millis() as u64),
                "Send deferred by channel gate"
            );
        }
        Ok(decision)
    }

    async fn decide(&self, channel: Channel) -> CampaignResult<GateDecision> {
        if self.store.get(&circuit_key(channel)).await?.is_some() {
            let remaining = self
                .store
                .ttl(&circuit_key(channel))
                .await?
                .unwrap_or_else(|| self.cooldown());
            return Ok(GateDecision::CircuitOpen {
                retry_after: remaining + self.jitter(),
            });
        }

        let window = self.window();
        let count = self.store.incr_windowed(&rate_key(channel), window).await?;
        if count <= self.limit_for(channel) {
            return Ok(GateDecision::Allowed);
        }
        let remaining = self
            .store
            .ttl(&rate_key(channel))
            .await?
            .unwrap_or(window);
        Ok(GateDecision::RateLimited {
            retry_after: remaining + self.jitter(),
        })
    }

    /// Offsets one failure. When the counter returns to zero the circuit is
    /// closed explicitly, even if its cooldown has not run out.
    pub async fn record_success(&self, channel: Channel) -> CampaignResult<()> {
        let remaining = self.store.decr_floor(&failures_key(channel)).await?;
        if remaining == 0 && self.store.delete(&circuit_key(channel)).await? {
            info!(channel = %channel, "Circuit closed after failures were offset");
            metrics::counter!("gate.circuit_closed", "channel" => channel.key()).increment(1);
            self.event_sink.emit(make_event(
                EventType::CircuitClosed,
                None,
                None,
                Some(channel.key().to_string()),
            ));
        }
        Ok(())
    }

    /// Counts a provider failure; opens the circuit once the threshold is hit.
    /// Returns `true` when this call opened it.
    pub async fn record_failure(&self, channel: Channel) -> CampaignResult<bool> {
        let window = Duration::from_secs(self.config.failure_window_secs.max(1));
        let failures = self
            .store
            .incr_windowed(&failures_key(channel), window)
            .await?;
        if failures < self.config.failure_threshold.max(1) {
            return Ok(false);
        }

        let opened = self
            .store
            .set_if_absent(&circuit_key(channel), failures as i64, self.cooldown())
            .await?;
        if opened {
            warn!(
                channel = %channel,
                failures,
                cooldown_secs = self.config.cooldown_secs,
                "Circuit opened"
            );
            metrics::counter!("gate.circuit_opened", "channel" => channel.key()).increment(1);
            self.event_sink.emit(make_event(
                EventType::CircuitOpened,
                None,
                None,
                Some(format!("{}: {failures} failures", channel.key())),
            ));
        }
        Ok(opened)
    }

    pub async fn state(&self, channel: Channel) -> CampaignResult<ChannelGateState> {
        let window_sends = self.store.get(&rate_key(channel)).await?.unwrap_or(0).max(0) as u64;
        let failures = self
            .store
            .get(&failures_key(channel))
            .await?
            .unwrap_or(0)
            .max(0) as u64;
        let circuit_open = self.store.get(&circuit_key(channel)).await?.is_some();
        let circuit_retry_after_ms = if circuit_open {
            self.store
                .ttl(&circuit_key(channel))
                .await?
                .map(|d| d.as_millis() as u64)
        } else {
            None
        };
        Ok(ChannelGateState {
            channel,
            window_sends,
            limit: self.limit_for(channel),
            failures,
            circuit_open,
            circuit_retry_after_ms,
        })
    }
}
