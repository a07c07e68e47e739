//! Campaign Flows — multi-step messaging flow engine.
//!
//! Runs the scheduler tick loop, the stale-stage sweeper and a pool of task
//! workers against either in-process stores or Redis.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use campaign_cache::{CounterStore, LocalCounterStore, RedisCounterStore, RedisDelayedQueue};
use campaign_channels::email::SendGridConfig;
use campaign_channels::sms::TwilioConfig;
use campaign_channels::{ChannelGate, SendGateway, SendGridSender, TwilioSender};
use campaign_core::channels::{Channel, MessageContent, Recipient};
use campaign_core::config::AppConfig;
use campaign_core::event_bus::LoggingSink;
use campaign_journey::types::{
    Branch, ComparisonOperator, ConditionMetric, ConditionNode, EndNode, Flow, FlowEdge, FlowNode,
    SendNode,
};
use campaign_journey::{
    Clock, EngineParts, FlowEngine, MemoryFlowStore, MemoryRecipientStore, MemoryWorkQueue,
    RedisWorkQueue, StaticContentResolver, SystemClock, WorkQueue,
};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Parser, Debug)]
#[command(name = "campaign-flows")]
#[command(about = "Multi-step messaging flow engine")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML/YAML/JSON, extension optional)
    #[arg(long, env = "CAMPAIGN_FLOWS_CONFIG")]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "CAMPAIGN_FLOWS__NODE_ID")]
    node_id: Option<String>,

    /// Number of task workers (overrides config)
    #[arg(long, env = "CAMPAIGN_FLOWS__WORKER__COUNT")]
    workers: Option<usize>,

    /// Keep rate counters and the task queue in process instead of Redis
    #[arg(long, default_value_t = false)]
    local: bool,

    /// Register a demo flow and launch it for this many synthetic recipients
    #[arg(long)]
    seed_demo: Option<usize>,

    #[arg(long, env = "SENDGRID_API_KEY", default_value = "")]
    sendgrid_api_key: String,

    #[arg(long, env = "SENDGRID_FROM_EMAIL", default_value = "flows@example.com")]
    sendgrid_from: String,

    #[arg(long, env = "TWILIO_ACCOUNT_SID", default_value = "")]
    twilio_account_sid: String,

    #[arg(long, env = "TWILIO_AUTH_TOKEN", default_value = "")]
    twilio_auth_token: String,

    #[arg(long, env = "TWILIO_FROM_NUMBER", default_value = "+15550100")]
    twilio_from: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "campaign_flows=info,campaign_journey=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Campaign Flows starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(node_id) = cli.node_id.clone() {
        config.node_id = node_id;
    }
    if let Some(workers) = cli.workers {
        config.worker.count = workers;
    }

    info!(
        node_id = %config.node_id,
        workers = config.worker.count,
        tick_interval_secs = config.scheduler.tick_interval_secs,
        local = cli.local,
        "Configuration loaded"
    );

    let metrics_addr = SocketAddr::new(config.metrics.host.parse()?, config.metrics.port);
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()?;
    info!(port = config.metrics.port, "Metrics exporter started");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (counters, queue): (Arc<dyn CounterStore>, Arc<dyn WorkQueue>) = if cli.local {
        (
            Arc::new(LocalCounterStore::new()),
            Arc::new(MemoryWorkQueue::new(clock.clone())),
        )
    } else {
        let counters = RedisCounterStore::new(&config.redis).await?;
        let delayed = RedisDelayedQueue::new(&config.redis).await?;
        (
            Arc::new(counters),
            Arc::new(RedisWorkQueue::new(delayed, clock.clone())),
        )
    };

    let gateway = SendGateway::new(Duration::from_millis(config.worker.send_timeout_ms))
        .with_sender(Arc::new(SendGridSender::new(SendGridConfig {
            api_key: cli.sendgrid_api_key.clone(),
            from_email: cli.sendgrid_from.clone(),
            from_name: "Campaign Flows".to_string(),
            click_tracking: true,
            open_tracking: true,
        })))
        .with_sender(Arc::new(TwilioSender::new(TwilioConfig {
            account_sid: cli.twilio_account_sid.clone(),
            auth_token: cli.twilio_auth_token.clone(),
            from_number: cli.twilio_from.clone(),
            messaging_service_sid: None,
            status_callback_url: None,
        })));

    let event_sink = Arc::new(LoggingSink);
    let gate = ChannelGate::new(counters, config.gate.clone()).with_event_sink(event_sink.clone());
    let recipients = Arc::new(MemoryRecipientStore::new());
    let content = StaticContentResolver::new()
        .with_fallback(
            Channel::Email,
            MessageContent {
                subject: Some("A message for you".to_string()),
                body: "<p>Hello from Campaign Flows</p>".to_string(),
                is_html: true,
            },
        )
        .with_fallback(
            Channel::Sms,
            MessageContent {
                subject: None,
                body: "Hello from Campaign Flows".to_string(),
                is_html: false,
            },
        );

    let engine = FlowEngine::new(
        EngineParts {
            store: Arc::new(MemoryFlowStore::new()),
            queue,
            recipients: recipients.clone(),
            content: Arc::new(content),
            gateway: Arc::new(gateway),
            gate: Arc::new(gate),
            clock,
            event_sink,
        },
        &config,
    );

    if let Some(count) = cli.seed_demo {
        let flow_id = engine.register_flow(demo_flow()).await?;
        for i in 0..count {
            let id = format!("demo-{i:06}");
            recipients.insert_for_flow(
                flow_id,
                Recipient {
                    email: Some(format!("{id}@example.com")),
                    phone: Some(format!("+1555{:07}", i % 10_000_000)),
                    id,
                },
            );
        }
        let execution = engine.launch_flow_audience(flow_id).await?;
        info!(execution_id = %execution.id, recipients = count, "Demo flow launched");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for worker_id in 0..config.worker.count.max(1) {
        let worker = engine.worker();
        let shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            worker.run(worker_id, shutdown).await;
        }));
    }

    let tick_engine = engine.clone();
    let tick_every = Duration::from_secs(config.scheduler.tick_interval_secs.max(1));
    let mut tick_shutdown = shutdown_rx.clone();
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = tick_engine.tick().await {
                        error!(error = %e, "Scheduler tick failed");
                    }
                }
                _ = tick_shutdown.changed() => break,
            }
        }
    }));

    let sweep_engine = engine.clone();
    let sweep_every = Duration::from_secs(config.scheduler.sweep_interval_secs.max(1));
    let mut sweep_shutdown = shutdown_rx;
    handles.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = sweep_engine.sweep().await {
                        error!(error = %e, "Recovery sweep failed");
                    }
                }
                _ = sweep_shutdown.changed() => break,
            }
        }
    }));

    info!("Campaign Flows is running");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping workers");
    shutdown_tx.send(true)?;
    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "Background task panicked");
        }
    }

    info!("Campaign Flows stopped");
    Ok(())
}

/// Welcome email, then a reminder by SMS to anyone who did not open it
/// within two days.
fn demo_flow() -> Flow {
    let node = |id: &str| id.to_string();
    Flow {
        id: Uuid::new_v4(),
        name: "welcome series".to_string(),
        entry_node: node("welcome"),
        nodes: vec![
            FlowNode::Send(SendNode {
                id: node("welcome"),
                name: "Welcome email".to_string(),
                channel: Channel::Email,
                wait_secs: 0,
            }),
            FlowNode::Condition(ConditionNode {
                id: node("opened_welcome"),
                name: "Opened the welcome email".to_string(),
                metric: ConditionMetric::Opened,
                operator: ComparisonOperator::Gt,
                threshold: 0,
                window_secs: 2 * 86_400,
            }),
            FlowNode::Send(SendNode {
                id: node("reminder"),
                name: "SMS reminder".to_string(),
                channel: Channel::Sms,
                wait_secs: 0,
            }),
            FlowNode::End(EndNode { id: node("done") }),
        ],
        edges: vec![
            FlowEdge {
                source: node("welcome"),
                target: node("opened_welcome"),
                branch: None,
            },
            FlowEdge {
                source: node("opened_welcome"),
                target: node("done"),
                branch: Some(Branch::Yes),
            },
            FlowEdge {
                source: node("opened_welcome"),
                target: node("reminder"),
                branch: Some(Branch::No),
            },
        ],
        created_at: chrono::Utc::now(),
    }
}
