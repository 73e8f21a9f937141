//! # vm-orchestrator
//!
//! VM lifecycle and snapshot orchestration engine with a REST and WebSocket
//! surface.
//!
//! The engine keeps a cache of VM records and per-VM snapshot trees
//! consistent with a virtualization control plane. Lifecycle and snapshot
//! operations run under per-VM exclusion with bounded retries, and the
//! control plane's event feed is applied in sequence order, with periodic
//! reconciliation repairing drift.
//!
//! ## Architecture
//!
//! ```text
//! Clients (HTTP, WebSocket)
//!     │
//!     ├── REST Handlers (api/)
//!     ├── WS Handler (ws/)
//!     │
//!     ├── LifecycleOrchestrator ── VmLocks, RetryPolicy (service/)
//!     ├── EventMonitor ── CheckpointStore (service/, persistence/)
//!     │
//!     ├── VmStateStore, SnapshotRegistry, EventBus (domain/)
//!     │
//!     └── ControlPlane trait (control_plane/)
//!           └── SimulatedControlPlane
//! ```

pub mod api;
pub mod app_state;
pub mod config;
pub mod control_plane;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod service;
pub mod ws;
