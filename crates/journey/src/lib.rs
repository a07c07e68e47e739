//! Flow execution engine — advances executions through a graph of send and
//! condition nodes, dispatching sends in bounded-memory batches and
//! recovering stage runs abandoned mid-flight.

#![warn(clippy::unwrap_used)]

pub mod clock;
pub mod completion;
pub mod dispatcher;
pub mod engine;
pub mod evaluator;
pub mod graph;
pub mod ports;
pub mod queue;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod task;
pub mod types;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use completion::{CompletionVerdict, StageCompletionPolicy};
pub use engine::{EngineParts, FlowEngine};
pub use graph::FlowGraph;
pub use ports::{ContentResolver, MemoryRecipientStore, RecipientStore, StaticContentResolver};
pub use queue::{MemoryWorkQueue, RedisWorkQueue, WorkQueue};
pub use scheduler::{ExecutionScheduler, SweepReport, TickReport};
pub use store::{FlowStore, MemoryFlowStore};
pub use worker::TaskWorker;
