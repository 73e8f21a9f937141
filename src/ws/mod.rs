//! WebSocket layer: connection handling, message routing, subscriptions.
//!
//! The WebSocket endpoint at `/ws` streams [`crate::domain::VmChange`]
//! notifications to clients that subscribed to the affected VM (or to
//! `"*"`), and answers `get_vm` lookups against the record cache.

pub mod connection;
pub mod handler;
pub mod messages;
pub mod subscription;
