//! End-to-end tests for the flow engine on in-memory stores: branching,
//! large-volume chunking, idempotent dispatch, recovery, and the channel gate.

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use campaign_cache::LocalCounterStore;
    use campaign_channels::{ChannelGate, MessageSender, Outbound, SendGateway, TransportError};
    use campaign_core::channels::{Channel, Engagement, MessageContent, Recipient, SendReceipt};
    use campaign_core::event_bus::{capture_sink, CaptureSink};
    use campaign_core::types::EventType;
    use campaign_core::AppConfig;
    use campaign_journey::dispatcher::{BatchDispatcher, DispatchOutcome};
    use campaign_journey::task::Task;
    use campaign_journey::types::{
        Audience, Branch, ComparisonOperator, ConditionMetric, ConditionNode, DeliveryState,
        Execution, ExecutionState, Flow, FlowEdge, FlowNode, SendNode, StageAudience, StageRun,
        StageRunState,
    };
    use campaign_journey::{
        Clock, EngineParts, FlowEngine, FlowStore, ManualClock, MemoryFlowStore, MemoryRecipientStore,
        MemoryWorkQueue, StaticContentResolver, WorkQueue,
    };
    use chrono::{Duration, Utc};
    use parking_lot::Mutex;
    use uuid::Uuid;

    // ─── Fixtures ───────────────────────────────────────────────────────────

    /// Email provider that records every accepted message.
    #[derive(Default)]
    struct FakeSender {
        sent: Mutex<Vec<(Uuid, String)>>,
        failure: Mutex<Option<TransportError>>,
        delay: Mutex<Option<StdDuration>>,
    }

    impl FakeSender {
        fn fail_with(&self, err: TransportError) {
            *self.failure.lock() = Some(err);
        }

        fn stall_for(&self, delay: StdDuration) {
            *self.delay.lock() = Some(delay);
        }

        fn sent_for(&self, stage_run_id: Uuid) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|(stage, _)| *stage == stage_run_id)
                .map(|(_, id)| id.clone())
                .collect()
        }

        fn total(&self) -> usize {
            self.sent.lock().len()
        }
    }

    #[async_trait]
    impl MessageSender for FakeSender {
        fn channel(&self) -> Channel {
            Channel::Email
        }

        fn provider_name(&self) -> &str {
            "fake"
        }

        async fn send(&self, message: &Outbound<'_>) -> Result<SendReceipt, TransportError> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failure.lock().clone() {
                return Err(err);
            }
            let mut sent = self.sent.lock();
            sent.push((message.stage_run_id, message.recipient.id.clone()));
            Ok(SendReceipt {
                channel: Channel::Email,
                provider_message_id: format!("fake-{}", sent.len()),
            })
        }
    }

    struct Harness {
        engine: FlowEngine,
        store: Arc<MemoryFlowStore>,
        queue: Arc<MemoryWorkQueue>,
        recipients: Arc<MemoryRecipientStore>,
        clock: Arc<ManualClock>,
        sender: Arc<FakeSender>,
        events: Arc<CaptureSink>,
    }

    fn base_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.gate.email_per_window = 1_000_000;
        config.gate.max_jitter_ms = 0;
        config.worker.dequeue_batch = 1_000;
        config
    }

    fn content() -> MessageContent {
        MessageContent {
            subject: Some("Hello".into()),
            body: "<p>Hi there</p>".into(),
            is_html: true,
        }
    }

    fn harness(config: AppConfig) -> Harness {
        let store = Arc::new(MemoryFlowStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(MemoryWorkQueue::new(clock.clone()));
        let recipients = Arc::new(MemoryRecipientStore::new());
        let sender = Arc::new(FakeSender::default());
        let events = capture_sink();
        let gateway = Arc::new(
            SendGateway::new(StdDuration::from_millis(config.worker.send_timeout_ms))
                .with_sender(sender.clone()),
        );
        let gate = Arc::new(
            ChannelGate::new(Arc::new(LocalCounterStore::new()), config.gate.clone())
                .with_event_sink(events.clone()),
        );
        let engine = FlowEngine::new(
            EngineParts {
                store: store.clone(),
                queue: queue.clone(),
                recipients: recipients.clone(),
                content: Arc::new(
                    StaticContentResolver::new().with_fallback(Channel::Email, content()),
                ),
                gateway,
                gate,
                clock: clock.clone(),
                event_sink: events.clone(),
            },
            &config,
        );
        Harness {
            engine,
            store,
            queue,
            recipients,
            clock,
            sender,
            events,
        }
    }

    fn send_node(id: &str, wait_secs: u64) -> FlowNode {
        FlowNode::Send(SendNode {
            id: id.into(),
            name: id.to_uppercase(),
            channel: Channel::Email,
            wait_secs,
        })
    }

    fn edge(source: &str, target: &str, branch: Option<Branch>) -> FlowEdge {
        FlowEdge {
            source: source.into(),
            target: target.into(),
            branch,
        }
    }

    fn flow(nodes: Vec<FlowNode>, edges: Vec<FlowEdge>) -> Flow {
        Flow {
            id: Uuid::new_v4(),
            name: "test flow".into(),
            entry_node: nodes[0].id().to_string(),
            nodes,
            edges,
            created_at: Utc::now(),
        }
    }

    /// `[email A] -> [opened > 0, 24h] -> yes:[email B], no:[email C]`
    fn branching_flow() -> Flow {
        flow(
            vec![
                send_node("a", 0),
                FlowNode::Condition(ConditionNode {
                    id: "opened".into(),
                    name: "opened email A".into(),
                    metric: ConditionMetric::Opened,
                    operator: ComparisonOperator::Gt,
                    threshold: 0,
                    window_secs: 86_400,
                }),
                send_node("b", 0),
                send_node("c", 0),
            ],
            vec![
                edge("a", "opened", None),
                edge("opened", "b", Some(Branch::Yes)),
                edge("opened", "c", Some(Branch::No)),
            ],
        )
    }

    fn seed_recipients(h: &Harness, flow_id: Uuid, n: usize) -> Vec<String> {
        (0..n)
            .map(|i| {
                let id = format!("r{i:05}");
                h.recipients.insert_for_flow(
                    flow_id,
                    Recipient {
                        id: id.clone(),
                        email: Some(format!("{id}@example.com")),
                        phone: None,
                    },
                );
                id
            })
            .collect()
    }

    /// Ticks and drains until neither finds anything to do.
    async fn pump(h: &Harness) {
        for _ in 0..50 {
            let report = h.engine.tick().await.unwrap();
            let drained = h.engine.drain_tasks().await.unwrap();
            if report.due == 0 && drained == 0 {
                return;
            }
        }
        panic!("flow did not settle");
    }

    async fn stage(h: &Harness, execution: &Execution, node_id: &str) -> StageRun {
        h.engine
            .stage_runs(execution.id)
            .await
            .unwrap()
            .into_iter()
            .find(|r| r.node_id == node_id)
            .unwrap_or_else(|| panic!("no stage run for {node_id}"))
    }

    async fn execution(h: &Harness, id: Uuid) -> Execution {
        h.engine.get_execution(id).await.unwrap().unwrap()
    }

    // ─── Branching ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_condition_splits_recipients_without_overlap() {
        let h = harness(base_config());
        let flow = branching_flow();
        let flow_id = h.engine.register_flow(flow).await.unwrap();
        let ids = seed_recipients(&h, flow_id, 100);
        let launched = h.engine.launch_flow(flow_id, ids.clone()).await.unwrap();
        assert_eq!(launched.state, ExecutionState::InProgress);

        pump(&h).await;
        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Completed);
        assert_eq!(h.sender.sent_for(a.id).len(), 100);

        // The condition waits out its observation window.
        let condition = stage(&h, &launched, "opened").await;
        assert_eq!(condition.state, StageRunState::Pending);
        assert_eq!(condition.source_send_stage, Some(a.id));

        for id in &ids[..20] {
            h.engine
                .record_engagement(a.id, id, Engagement::Opened)
                .await
                .unwrap();
        }
        h.clock.advance(Duration::hours(24));
        pump(&h).await;

        let result = h
            .engine
            .condition_result(condition.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((result.yes_count, result.no_count), (20, 80));

        let b = stage(&h, &launched, "b").await;
        let c = stage(&h, &launched, "c").await;
        assert_eq!(b.branch, Some(Branch::Yes));
        let sent_b: HashSet<String> = h.sender.sent_for(b.id).into_iter().collect();
        let sent_c: HashSet<String> = h.sender.sent_for(c.id).into_iter().collect();
        assert_eq!(sent_b.len(), 20);
        assert_eq!(sent_c.len(), 80);
        assert!(sent_b.is_disjoint(&sent_c));
        assert_eq!(sent_b, ids[..20].iter().cloned().collect());

        let done = execution(&h, launched.id).await;
        assert_eq!(done.state, ExecutionState::Completed);
        assert!(done.next_due_at.is_none());
        assert_eq!(h.events.count_type(EventType::ExecutionCompleted), 1);
        assert_eq!(h.events.count_type(EventType::ConditionEvaluated), 1);
    }

    // ─── Large volume ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_large_stage_runs_in_twelve_chunks() {
        let h = harness(base_config());
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("blast", 0)], vec![]))
            .await
            .unwrap();
        seed_recipients(&h, flow_id, 12_000);
        let launched = h.engine.launch_flow_audience(flow_id).await.unwrap();
        assert_eq!(launched.recipients.len(), 12_000);

        h.engine.tick().await.unwrap();
        let chunks: Vec<u32> = h
            .queue
            .snapshot()
            .into_iter()
            .filter_map(|q| match q.task {
                Task::DispatchChunk { chunk_index, .. } => Some(chunk_index),
                Task::Send { .. } => None,
            })
            .collect();
        assert_eq!(chunks, (0..12).collect::<Vec<_>>());
        let blast = stage(&h, &launched, "blast").await;
        assert_eq!(blast.state, StageRunState::Batching);

        // Eleven chunks in, the stage cannot complete yet.
        h.engine.process_due_tasks(11).await.unwrap();
        let blast = stage(&h, &launched, "blast").await;
        let progress = blast.progress.clone().unwrap();
        assert_eq!(progress.chunks.len(), 11);
        assert_eq!(blast.state, StageRunState::Batching);

        h.engine.drain_tasks().await.unwrap();
        let blast = stage(&h, &launched, "blast").await;
        assert_eq!(blast.state, StageRunState::Completed);
        assert_eq!(blast.progress.unwrap().chunks.len(), 12);
        let counts = h.engine.send_counts(blast.id).await.unwrap();
        assert_eq!((counts.sent, counts.pending), (12_000, 0));
        assert_eq!(h.sender.total(), 12_000);
        assert_eq!(
            execution(&h, launched.id).await.state,
            ExecutionState::Completed
        );
    }

    #[tokio::test]
    async fn test_large_stage_fails_below_completion_ratio() {
        let h = harness(base_config());
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("blast", 0)], vec![]))
            .await
            .unwrap();
        // 30% of the audience has no email address.
        for i in 0..12_000 {
            let id = format!("r{i:05}");
            h.recipients.insert_for_flow(
                flow_id,
                Recipient {
                    id: id.clone(),
                    email: (i % 10 >= 3).then(|| format!("{id}@example.com")),
                    phone: Some("+15550100".into()),
                },
            );
        }
        let launched = h.engine.launch_flow_audience(flow_id).await.unwrap();
        pump(&h).await;

        let blast = stage(&h, &launched, "blast").await;
        assert_eq!(blast.state, StageRunState::Failed);
        assert_eq!(blast.progress.unwrap().skipped_no_destination(), 3_600);
        let done = execution(&h, launched.id).await;
        assert_eq!(done.state, ExecutionState::Failed);
        let reason = done.error.unwrap();
        assert!(reason.contains("8400 of 12000"), "{reason}");
    }

    // ─── Idempotency ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_redispatch_never_duplicates_send_records() {
        let config = base_config();
        let store = Arc::new(MemoryFlowStore::new());
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(MemoryWorkQueue::new(clock.clone()));
        let recipients = Arc::new(MemoryRecipientStore::new());
        let ids: Vec<String> = (0..10).map(|i| format!("r{i}")).collect();
        for id in &ids {
            recipients.insert(Recipient {
                id: id.clone(),
                email: Some(format!("{id}@example.com")),
                phone: None,
            });
        }
        let dispatcher = BatchDispatcher::new(
            store.clone(),
            queue.clone(),
            recipients,
            Arc::new(StaticContentResolver::new().with_fallback(Channel::Email, content())),
            clock.clone(),
            config.dispatch.clone(),
        );

        let execution = Execution::new(
            Uuid::new_v4(),
            Audience::Explicit { ids: ids.clone() },
            clock.now(),
        );
        store.insert_execution(execution.clone()).await.unwrap();
        let node = send_node("a", 0);
        let run = StageRun::pending(
            execution.id,
            &node,
            StageAudience::Execution,
            clock.now(),
        );
        store.insert_stage_run(run.clone()).await.unwrap();
        let FlowNode::Send(send) = &node else {
            unreachable!()
        };

        let first = dispatcher.dispatch(&execution, &run, send).await.unwrap();
        assert_eq!(
            first,
            DispatchOutcome::Direct {
                enqueued: 10,
                skipped: 0
            }
        );
        let second = dispatcher.dispatch(&execution, &run, send).await.unwrap();
        assert_eq!(second, DispatchOutcome::AlreadyDispatched);

        // A crash that lost the state write sends the stage through again.
        store
            .update_stage_run(
                run.id,
                Box::new(|r| {
                    r.state = StageRunState::Pending;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let third = dispatcher.dispatch(&execution, &run, send).await.unwrap();
        assert_eq!(
            third,
            DispatchOutcome::Direct {
                enqueued: 0,
                skipped: 0
            }
        );
        assert_eq!(store.send_counts(run.id).await.unwrap().total(), 10);
        assert_eq!(queue.queued_for_stage(run.id).await.unwrap(), 10);
    }

    // ─── Recovery ───────────────────────────────────────────────────────────

    fn two_step_flow() -> Flow {
        flow(
            vec![send_node("a", 0), send_node("b", 0)],
            vec![edge("a", "b", None)],
        )
    }

    #[tokio::test]
    async fn test_killed_worker_converges_after_sweep() {
        let h = harness(base_config());
        let flow_id = h.engine.register_flow(two_step_flow()).await.unwrap();
        let ids = seed_recipients(&h, flow_id, 50);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();

        h.engine.tick().await.unwrap();
        h.engine.process_due_tasks(20).await.unwrap();
        assert_eq!(h.queue.discard_all(), 30);

        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Executing);
        let counts = h.engine.send_counts(a.id).await.unwrap();
        assert_eq!((counts.sent, counts.pending), (20, 30));

        // Not stale yet: nothing happens.
        h.clock.advance(Duration::minutes(10));
        assert_eq!(h.engine.sweep().await.unwrap().stale, 0);

        h.clock.advance(Duration::minutes(21));
        let report = h.engine.sweep().await.unwrap();
        assert_eq!((report.stale, report.resumed), (1, 1));
        pump(&h).await;

        let a = stage(&h, &launched, "a").await;
        let b = stage(&h, &launched, "b").await;
        assert_eq!(a.state, StageRunState::Completed);
        assert!(a.recovered);
        assert_eq!(b.state, StageRunState::Completed);
        // Already-sent recipients were not sent again.
        let sent_a = h.sender.sent_for(a.id);
        assert_eq!(sent_a.len(), 50);
        assert_eq!(sent_a.iter().collect::<HashSet<_>>().len(), 50);
        assert_eq!(
            execution(&h, launched.id).await.state,
            ExecutionState::Completed
        );
        assert!(h.events.count_type(EventType::StageRecovered) >= 1);
    }

    #[tokio::test]
    async fn test_sweep_force_completes_when_evidence_is_settled() {
        let h = harness(base_config());
        let flow_id = h.engine.register_flow(two_step_flow()).await.unwrap();
        let ids = seed_recipients(&h, flow_id, 10);
        let launched = h.engine.launch_flow(flow_id, ids.clone()).await.unwrap();
        h.engine.tick().await.unwrap();
        let a = stage(&h, &launched, "a").await;

        // The worker delivered everything but died before reporting back.
        h.queue.discard_all();
        for id in &ids {
            let now = h.clock.now();
            h.store
                .update_send_record(
                    a.id,
                    id,
                    Box::new(move |r| {
                        r.mark_sent("lost-ack".into(), now);
                        Ok(())
                    }),
                )
                .await
                .unwrap();
        }

        h.clock.advance(Duration::minutes(31));
        let report = h.engine.sweep().await.unwrap();
        assert_eq!(report.completed, 1);

        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Completed);
        assert!(a.recovered);
        let b = stage(&h, &launched, "b").await;
        assert_eq!(b.state, StageRunState::Pending);
        assert_eq!(b.parent_id, Some(a.id));
    }

    #[tokio::test]
    async fn test_lost_chunks_are_redispatched() {
        let mut config = base_config();
        config.dispatch.direct_send_threshold = 10;
        config.dispatch.chunk_size = 10;
        let h = harness(config);
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("a", 0)], vec![]))
            .await
            .unwrap();
        let ids = seed_recipients(&h, flow_id, 30);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();
        h.engine.tick().await.unwrap();
        assert_eq!(h.queue.discard_all(), 3);

        h.clock.advance(Duration::minutes(11));
        let report = h.engine.sweep().await.unwrap();
        assert_eq!(report.resumed, 1);
        pump(&h).await;

        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Completed);
        assert_eq!(h.sender.sent_for(a.id).len(), 30);
    }

    // ─── Channel gate ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_sends_are_deferred_not_failed() {
        let mut config = base_config();
        config.gate.email_per_window = 5;
        config.gate.window_secs = 60;
        let h = harness(config);
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("a", 0)], vec![]))
            .await
            .unwrap();
        let ids = seed_recipients(&h, flow_id, 8);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();

        h.engine.tick().await.unwrap();
        h.engine.drain_tasks().await.unwrap();
        let a = stage(&h, &launched, "a").await;
        assert_eq!(h.sender.sent_for(a.id).len(), 5);
        let counts = h.engine.send_counts(a.id).await.unwrap();
        assert_eq!((counts.sent, counts.pending, counts.failed), (5, 3, 0));
        assert_eq!(h.events.count_type(EventType::MessageDeferred), 3);
        assert_eq!(h.queue.len().await.unwrap(), 3);

        let deferred = h
            .store
            .pending_send_records(a.id, 10)
            .await
            .unwrap();
        assert!(deferred.iter().all(|r| r.attempts == 0));

        h.clock.advance(Duration::seconds(61));
        tokio::time::advance(StdDuration::from_secs(61)).await;
        h.engine.drain_tasks().await.unwrap();

        assert_eq!(h.sender.sent_for(a.id).len(), 8);
        assert_eq!(
            stage(&h, &launched, "a").await.state,
            StageRunState::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_sends_use_up_attempts() {
        let mut config = base_config();
        config.worker.task_timeout_ms = 1_000;
        config.worker.send_timeout_ms = 10_000;
        config.worker.max_attempts = 2;
        let h = harness(config);
        h.sender.stall_for(StdDuration::from_secs(5));
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("a", 0)], vec![]))
            .await
            .unwrap();
        let ids = seed_recipients(&h, flow_id, 1);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();

        h.engine.tick().await.unwrap();
        h.engine.drain_tasks().await.unwrap();
        let a = stage(&h, &launched, "a").await;
        let record = h
            .store
            .get_send_record(a.id, "r00000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!((record.state, record.attempts), (DeliveryState::Pending, 1));
        assert_eq!(h.queue.len().await.unwrap(), 1);

        for _ in 0..5 {
            h.clock.advance(Duration::minutes(10));
            h.engine.drain_tasks().await.unwrap();
        }

        let record = h
            .store
            .get_send_record(a.id, "r00000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!((record.state, record.attempts), (DeliveryState::Failed, 2));
        assert!(record.error.unwrap().contains("timed out"));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.sender.total(), 0);
        assert!(stage(&h, &launched, "a").await.state.is_terminal());
    }

    #[tokio::test]
    async fn test_provider_failures_open_circuit_and_exhaust_retries() {
        let mut config = base_config();
        config.gate.failure_threshold = 3;
        config.worker.max_attempts = 2;
        let h = harness(config);
        h.sender
            .fail_with(TransportError::Transient("503 from provider".into()));
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("a", 0)], vec![]))
            .await
            .unwrap();
        let ids = seed_recipients(&h, flow_id, 5);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();

        h.engine.tick().await.unwrap();
        h.engine.drain_tasks().await.unwrap();

        let gate = h.engine.gate_state(Channel::Email).await.unwrap();
        assert!(gate.circuit_open);
        assert_eq!(h.events.count_type(EventType::CircuitOpened), 1);
        let a = stage(&h, &launched, "a").await;
        let records = h.store.pending_send_records(a.id, 10).await.unwrap();
        assert_eq!(records.len(), 5);
        // Three recipients burned an attempt before the circuit opened; the
        // other two were deferred without one.
        let attempted = records.iter().filter(|r| r.attempts == 1).count();
        assert_eq!(attempted, 3);
        assert_eq!(h.sender.total(), 0);
    }

    // ─── Cancellation and isolation ─────────────────────────────────────────

    #[tokio::test]
    async fn test_cancel_stops_queued_sends() {
        let h = harness(base_config());
        let flow_id = h.engine.register_flow(two_step_flow()).await.unwrap();
        let ids = seed_recipients(&h, flow_id, 10);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();
        h.engine.tick().await.unwrap();

        let cancelled = h.engine.cancel_execution(launched.id).await.unwrap();
        assert_eq!(cancelled.state, ExecutionState::Cancelled);
        h.engine.drain_tasks().await.unwrap();

        assert_eq!(h.sender.total(), 0);
        let a = stage(&h, &launched, "a").await;
        assert!(a.cancelled);
        assert_eq!(a.state, StageRunState::Failed);
        assert_eq!(h.engine.stage_runs(launched.id).await.unwrap().len(), 1);
        let record = h
            .store
            .get_send_record(a.id, "r00000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, DeliveryState::Failed);
        assert_eq!(record.error.as_deref(), Some("cancelled"));
        assert_eq!(
            execution(&h, launched.id).await.state,
            ExecutionState::Cancelled
        );
        assert!(h.engine.cancel_execution(launched.id).await.is_err());
    }

    fn chunked_config() -> AppConfig {
        let mut config = base_config();
        config.dispatch.direct_send_threshold = 10;
        config.dispatch.chunk_size = 10;
        config
    }

    #[tokio::test]
    async fn test_cancel_while_batching_settles_the_stage() {
        let h = harness(chunked_config());
        let flow_id = h.engine.register_flow(two_step_flow()).await.unwrap();
        let ids = seed_recipients(&h, flow_id, 30);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();
        h.engine.tick().await.unwrap();
        h.engine.process_due_tasks(1).await.unwrap();
        assert_eq!(
            stage(&h, &launched, "a").await.state,
            StageRunState::Batching
        );

        h.engine.cancel_execution(launched.id).await.unwrap();
        h.engine.drain_tasks().await.unwrap();

        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Failed);
        assert_eq!(a.error.as_deref(), Some("execution cancelled"));
        assert_eq!(a.progress.unwrap().chunks.len(), 1);
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.sender.total(), 0);
        let counts = h.engine.send_counts(a.id).await.unwrap();
        assert_eq!((counts.failed, counts.pending), (10, 0));

        h.clock.advance(Duration::minutes(11));
        let report = h.engine.sweep().await.unwrap();
        assert_eq!((report.stale, report.resumed), (0, 0));
        assert_eq!(h.queue.len().await.unwrap(), 0);
        assert_eq!(h.engine.stage_runs(launched.id).await.unwrap().len(), 1);
        assert_eq!(
            execution(&h, launched.id).await.state,
            ExecutionState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_fails_pending_stage() {
        let h = harness(base_config());
        let flow_id = h.engine.register_flow(two_step_flow()).await.unwrap();
        let ids = seed_recipients(&h, flow_id, 5);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();
        assert_eq!(
            stage(&h, &launched, "a").await.state,
            StageRunState::Pending
        );

        h.engine.cancel_execution(launched.id).await.unwrap();
        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Failed);
        assert_eq!(a.error.as_deref(), Some("execution cancelled"));
        assert!(a.completed_at.is_some());

        pump(&h).await;
        assert_eq!(h.sender.total(), 0);
        assert_eq!(h.engine.send_counts(a.id).await.unwrap().total(), 0);
        assert_eq!(h.engine.stage_runs(launched.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_flagged_batching_stage_fails_once_chunks_are_skipped() {
        let h = harness(chunked_config());
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("a", 0)], vec![]))
            .await
            .unwrap();
        let ids = seed_recipients(&h, flow_id, 30);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();
        h.engine.tick().await.unwrap();
        let a = stage(&h, &launched, "a").await;

        // Cancellation flagged the stage but never got to settle it.
        h.store
            .update_stage_run(
                a.id,
                Box::new(|r| {
                    r.cancelled = true;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        h.engine.drain_tasks().await.unwrap();

        let a = stage(&h, &launched, "a").await;
        assert_eq!(a.state, StageRunState::Failed);
        assert!(a.progress.unwrap().chunks.is_empty());
        assert_eq!(h.queue.len().await.unwrap(), 0);

        h.clock.advance(Duration::minutes(11));
        assert_eq!(h.engine.sweep().await.unwrap().stale, 0);
        assert_eq!(h.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_engagement_on_unsent_record_is_rejected() {
        let h = harness(base_config());
        let flow_id = h
            .engine
            .register_flow(flow(vec![send_node("a", 0)], vec![]))
            .await
            .unwrap();
        let ids = seed_recipients(&h, flow_id, 3);
        let launched = h.engine.launch_flow(flow_id, ids).await.unwrap();
        h.engine.tick().await.unwrap();
        let a = stage(&h, &launched, "a").await;

        let err = h
            .engine
            .record_engagement(a.id, "r00000", Engagement::Clicked)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            campaign_core::CampaignError::InvalidTransition(_)
        ));
        let record = h
            .store
            .get_send_record(a.id, "r00000")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state, DeliveryState::Pending);
        assert_eq!((record.open_count, record.click_count), (0, 0));

        h.engine.drain_tasks().await.unwrap();
        let record = h
            .engine
            .record_engagement(a.id, "r00000", Engagement::Clicked)
            .await
            .unwrap();
        assert_eq!(record.state, DeliveryState::Clicked);
    }

    #[tokio::test]
    async fn test_missing_content_fails_only_its_execution() {
        let config = base_config();
        let store = Arc::new(MemoryFlowStore::new());
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(MemoryWorkQueue::new(clock.clone()));
        let recipients = Arc::new(MemoryRecipientStore::new());
        recipients.insert(Recipient {
            id: "r1".into(),
            email: Some("r1@example.com".into()),
            phone: None,
        });
        let engine = FlowEngine::new(
            EngineParts {
                store: store.clone(),
                queue,
                recipients,
                content: Arc::new(StaticContentResolver::new().with_node("ok", content())),
                gateway: Arc::new(
                    SendGateway::new(StdDuration::from_secs(1))
                        .with_sender(Arc::new(FakeSender::default())),
                ),
                gate: Arc::new(ChannelGate::new(
                    Arc::new(LocalCounterStore::new()),
                    config.gate.clone(),
                )),
                clock,
                event_sink: capture_sink(),
            },
            &config,
        );

        let broken = engine
            .register_flow(flow(vec![send_node("unconfigured", 0)], vec![]))
            .await
            .unwrap();
        let healthy = engine
            .register_flow(flow(vec![send_node("ok", 0)], vec![]))
            .await
            .unwrap();
        let broken = engine.launch_flow(broken, vec!["r1".into()]).await.unwrap();
        let healthy = engine
            .launch_flow(healthy, vec!["r1".into()])
            .await
            .unwrap();

        let report = engine.tick().await.unwrap();
        assert_eq!((report.due, report.failed, report.advanced), (2, 1, 1));

        let broken = engine.get_execution(broken.id).await.unwrap().unwrap();
        assert_eq!(broken.state, ExecutionState::Failed);
        assert!(broken.error.unwrap().contains("not configured"));
        let healthy = engine.get_execution(healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.state, ExecutionState::InProgress);
    }

    #[tokio::test]
    async fn test_unknown_flow_cannot_launch() {
        let h = harness(base_config());
        let err = h
            .engine
            .launch_flow(Uuid::new_v4(), vec!["r1".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, campaign_core::CampaignError::NotFound(_)));
    }
}
