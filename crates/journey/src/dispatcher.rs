//! Batch dispatcher — turns a send stage run into per-recipient send tasks.
//!
//! Audiences up to the direct-send threshold are materialized at once and
//! dispatched as one batch. Larger audiences are split into fixed-size
//! chunks addressed by offset/limit; each chunk is its own queued task, so
//! the full id list is never held in memory.

use std::sync::Arc;

use campaign_core::channels::{Channel, RecipientId};
use campaign_core::config::DispatchConfig;
use campaign_core::event_bus::{make_event, noop_sink, EventSink};
use campaign_core::types::EventType;
use campaign_core::{CampaignError, CampaignResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::ports::{ContentResolver, RecipientStore};
use crate::queue::WorkQueue;
use crate::state_machine::check_stage;
use crate::store::FlowStore;
use crate::task::Task;
use crate::types::{
    Audience, ChunkProgress, DispatchMode, Execution, SendNode, SendRecord, StageAudience,
    StageProgress, StageRun, StageRunState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Direct { enqueued: u64, skipped: u64 },
    Chunked { chunks: u32 },
    /// Another worker claimed the stage first.
    AlreadyDispatched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Dispatched(ChunkProgress),
    /// Chunk already recorded, or the stage is no longer running.
    Skipped,
}

pub struct BatchDispatcher {
    store: Arc<dyn FlowStore>,
    queue: Arc<dyn WorkQueue>,
    recipients: Arc<dyn RecipientStore>,
    content: Arc<dyn ContentResolver>,
    clock: Arc<dyn Clock>,
    config: DispatchConfig,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BatchDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchDispatcher")
            .field("config", &self.config)
            .finish()
    }
}

fn slice(ids: &[RecipientId], offset: usize, limit: usize) -> Vec<RecipientId> {
    ids.iter().skip(offset).take(limit).cloned().collect()
}

impl BatchDispatcher {
    pub fn new(
        store: Arc<dyn FlowStore>,
        queue: Arc<dyn WorkQueue>,
        recipients: Arc<dyn RecipientStore>,
        content: Arc<dyn ContentResolver>,
        clock: Arc<dyn Clock>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            queue,
            recipients,
            content,
            clock,
            config,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn audience_len(execution: &Execution, stage: &StageRun) -> usize {
        match &stage.audience {
            StageAudience::Subset { ids } => ids.len(),
            StageAudience::Execution => execution.recipients.len(),
        }
    }

    /// One page of the stage's recipients.
    pub async fn page(
        &self,
        execution: &Execution,
        stage: &StageRun,
        offset: usize,
        limit: usize,
    ) -> CampaignResult<Vec<RecipientId>> {
        match &stage.audience {
            StageAudience::Subset { ids } => Ok(slice(ids, offset, limit)),
            StageAudience::Execution => match &execution.recipients {
                Audience::Explicit { ids } => Ok(slice(ids, offset, limit)),
                Audience::Store { flow_id, .. } => {
                    self.recipients.list_ids(*flow_id, offset, limit).await
                }
            },
        }
    }

    /// Every recipient of the stage, read page by page.
    pub async fn all_recipients(
        &self,
        execution: &Execution,
        stage: &StageRun,
    ) -> CampaignResult<Vec<RecipientId>> {
        let total = Self::audience_len(execution, stage);
        let page_size = self.config.chunk_size.max(1);
        let mut out = Vec::with_capacity(total);
        while out.len() < total {
            let page = self.page(execution, stage, out.len(), page_size).await?;
            if page.is_empty() {
                break;
            }
            out.extend(page);
        }
        Ok(out)
    }

    /// Starts a pending send stage on the direct or the chunked path.
    pub async fn dispatch(
        &self,
        execution: &Execution,
        stage: &StageRun,
        node: &SendNode,
    ) -> CampaignResult<DispatchOutcome> {
        let now = self.clock.now();
        let total = Self::audience_len(execution, stage) as u64;
        let content = match self.content.resolve(&node.id, node.channel).await {
            Ok(content) => content,
            Err(CampaignError::NotFound(what)) => {
                return Err(CampaignError::graph(format!("{what} is not configured")))
            }
            Err(e) => return Err(e),
        };

        let direct = total <= self.config.direct_send_threshold as u64;
        let (target, progress) = if direct {
            (StageRunState::Executing, StageProgress::direct(total, now))
        } else {
            (
                StageRunState::Batching,
                StageProgress::chunked(total, self.config.chunk_size as u64, now),
            )
        };
        let chunks_total = progress.chunks_total;
        let batch_id = Uuid::new_v4();
        let channel = node.channel;

        let claimed = self
            .store
            .update_stage_run(
                stage.id,
                Box::new(move |run| {
                    check_stage(run.state, target)?;
                    run.state = target;
                    run.started_at = Some(now);
                    run.batch_id = Some(batch_id);
                    run.channel = Some(channel);
                    run.content = Some(content);
                    run.progress = Some(progress);
                    Ok(())
                }),
            )
            .await;
        let stage = match claimed {
            Ok(stage) => stage,
            Err(CampaignError::InvalidTransition(reason)) => {
                debug!(stage_run_id = %stage.id, %reason, "Stage already dispatched");
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
            Err(e) => return Err(e),
        };

        let mode = if direct {
            DispatchMode::Direct
        } else {
            DispatchMode::Chunked
        };
        metrics::counter!("flow.stage_dispatched", "mode" => mode.as_str()).increment(1);
        self.event_sink.emit(make_event(
            EventType::StageDispatched,
            Some(stage.execution_id),
            Some(stage.id),
            Some(format!("{} via {} ({total} recipients)", node.id, mode.as_str())),
        ));

        if direct {
            let ids = self.page(execution, &stage, 0, total as usize).await?;
            let chunk = self
                .dispatch_recipients(&stage, node.channel, &ids, batch_id)
                .await?;
            self.record_chunk(stage.id, 0, chunk.clone()).await?;
            info!(
                execution_id = %stage.execution_id,
                stage_run_id = %stage.id,
                node_id = %node.id,
                enqueued = chunk.enqueued,
                skipped = chunk.skipped_no_destination,
                "Stage dispatched directly"
            );
            return Ok(DispatchOutcome::Direct {
                enqueued: chunk.enqueued,
                skipped: chunk.skipped_no_destination,
            });
        }

        self.enqueue_chunks(stage.id, 0..chunks_total).await?;
        info!(
            execution_id = %stage.execution_id,
            stage_run_id = %stage.id,
            node_id = %node.id,
            recipients = total,
            chunks = chunks_total,
            "Stage split into chunks"
        );
        Ok(DispatchOutcome::Chunked {
            chunks: chunks_total,
        })
    }

    pub async fn enqueue_chunks(
        &self,
        stage_run_id: Uuid,
        chunks: impl IntoIterator<Item = u32> + Send,
    ) -> CampaignResult<u32> {
        let mut enqueued = 0;
        for chunk_index in chunks {
            self.queue
                .enqueue(
                    Task::DispatchChunk {
                        stage_run_id,
                        chunk_index,
                        attempt: 0,
                    },
                    None,
                )
                .await?;
            enqueued += 1;
        }
        Ok(enqueued)
    }

    /// Materializes one chunk of a batching stage and enqueues its sends.
    pub async fn dispatch_chunk(
        &self,
        stage_run_id: Uuid,
        chunk_index: u32,
    ) -> CampaignResult<ChunkOutcome> {
        let Some(stage) = self.store.get_stage_run(stage_run_id).await? else {
            warn!(stage_run_id = %stage_run_id, "Chunk for unknown stage run");
            return Ok(ChunkOutcome::Skipped);
        };
        if stage.cancelled || !stage.state.is_active() {
            return Ok(ChunkOutcome::Skipped);
        }
        let Some(progress) = stage.progress.as_ref() else {
            return Err(CampaignError::Store(format!(
                "stage run {stage_run_id} is active without progress"
            )));
        };
        if progress.chunks.contains_key(&chunk_index) {
            return Ok(ChunkOutcome::Skipped);
        }
        if chunk_index >= progress.chunks_total {
            warn!(stage_run_id = %stage_run_id, chunk_index, "Chunk index out of range");
            return Ok(ChunkOutcome::Skipped);
        }
        let execution = self
            .store
            .get_execution(stage.execution_id)
            .await?
            .ok_or_else(|| CampaignError::not_found(format!("execution {}", stage.execution_id)))?;
        let channel = self.channel_of(&stage)?;

        let (offset, limit) = progress.chunk_bounds(chunk_index);
        let ids = self.page(&execution, &stage, offset, limit).await?;
        let chunk = self
            .dispatch_recipients(&stage, channel, &ids, Uuid::new_v4())
            .await?;
        self.record_chunk(stage_run_id, chunk_index, chunk.clone())
            .await?;
        debug!(
            stage_run_id = %stage_run_id,
            chunk_index,
            enqueued = chunk.enqueued,
            skipped = chunk.skipped_no_destination,
            "Chunk dispatched"
        );
        Ok(ChunkOutcome::Dispatched(chunk))
    }

    fn channel_of(&self, stage: &StageRun) -> CampaignResult<Channel> {
        stage
            .channel
            .ok_or_else(|| CampaignError::Store(format!("stage run {} has no channel", stage.id)))
    }

    /// Creates the send record for each recipient with a destination and
    /// enqueues its send. Recipients that already have a live record are
    /// skipped, so re-dispatching a chunk never sends twice.
    async fn dispatch_recipients(
        &self,
        stage: &StageRun,
        channel: Channel,
        ids: &[RecipientId],
        batch_id: Uuid,
    ) -> CampaignResult<ChunkProgress> {
        let now = self.clock.now();
        let mut chunk = ChunkProgress {
            batch_id,
            enqueued: 0,
            skipped_no_destination: 0,
            already_claimed: 0,
            dispatched_at: now,
        };
        for recipient_id in ids {
            let destination = match self.recipients.get(recipient_id).await? {
                Some(recipient) => recipient.destination(channel).map(str::to_string),
                None => None,
            };
            let Some(destination) = destination else {
                chunk.skipped_no_destination += 1;
                continue;
            };
            let record = SendRecord::pending(
                stage.id,
                stage.execution_id,
                recipient_id.clone(),
                channel,
                destination,
                now,
            );
            if !self.store.claim_send_record(record).await?.should_send() {
                chunk.already_claimed += 1;
                continue;
            }
            self.queue
                .enqueue(
                    Task::Send {
                        stage_run_id: stage.id,
                        recipient_id: recipient_id.clone(),
                        attempt: 0,
                    },
                    None,
                )
                .await?;
            chunk.enqueued += 1;
        }
        Ok(chunk)
    }

    async fn record_chunk(
        &self,
        stage_run_id: Uuid,
        chunk_index: u32,
        chunk: ChunkProgress,
    ) -> CampaignResult<()> {
        let now = self.clock.now();
        self.store
            .update_stage_run(
                stage_run_id,
                Box::new(move |run| {
                    let progress = run.progress.as_mut().ok_or_else(|| {
                        CampaignError::Store(format!("stage run {} has no progress", run.id))
                    })?;
                    progress.chunks.entry(chunk_index).or_insert(chunk);
                    progress.last_progress_at = now;
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }
}
