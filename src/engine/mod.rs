pub mod chunker;
pub mod controller;
pub mod executor;
pub mod inventory;
pub mod plan;
pub mod reconciler;
pub mod retry;
pub mod summary;
pub mod types;

pub use chunker::chunk_domains;
pub use controller::{RunController, RunMode, RunReport, RunState, SyncSettings};
pub use executor::{ExecutionReport, Executor, ExecutorSettings, OperationResult, Outcome, SkipReason};
pub use inventory::InventoryReader;
pub use plan::{ListRef, Operation, OperationKind, Plan, PlanMode, Stage, Step};
pub use reconciler::Reconciler;
pub use retry::{Retried, RetryPolicy};
pub use summary::{RunStatus, RunSummary};
pub use types::{DesiredChunk, Inventory, ListNaming, RemoteList, RemotePolicy};
