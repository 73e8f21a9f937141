//! Service layer: operation orchestration and event-feed consumption.
//!
//! [`LifecycleOrchestrator`] validates and dispatches lifecycle and snapshot
//! operations under per-VM exclusion ([`VmLocks`]) with bounded retries
//! ([`RetryPolicy`]). [`EventMonitor`] applies the control-plane event feed
//! and reconciles drift. The [`maintenance`] tasks purge tombstones and
//! reconcile periodically.

pub mod event_monitor;
pub mod maintenance;
pub mod operation;
pub mod orchestrator;
pub mod retry;
pub mod vm_locks;

pub use event_monitor::{EventMonitor, IngestOutcome, MonitorSettings, ReconcileReport};
pub use operation::{Operation, OperationHandle, OperationOutcome, OperationStatus, SubmitMode};
pub use orchestrator::LifecycleOrchestrator;
pub use retry::{RetryError, RetryPolicy};
pub use tokio_util::sync::CancellationToken;
pub use vm_locks::{VmGuard, VmLocks};
