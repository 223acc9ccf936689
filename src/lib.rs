//! dlmcore: the core of a distributed lock manager.
//!
//! Cooperating nodes share named resources. Each resource is mastered by one
//! node, which keeps the authoritative granted, converting and blocked queues
//! and decides every grant; the other nodes keep shadow copies of their own
//! locks and talk to the master through a [`dispatch::Dispatcher`].
//!
//! - [`mode`], [`lock`], [`resource`]: lock modes, lock entries, resource queues
//! - [`engine`]: the compatibility and FIFO queueing algorithm
//! - [`registry`], [`directory`]: where resources live and who masters them
//! - [`wire`], [`dispatch`]: messages, their encoding, and their transport
//! - [`manager`]: the per-node API, master and remote handlers, recovery
//! - [`cluster`], [`simulate`]: in-process clusters and scripted scenarios

pub mod cli;
pub mod cluster;
pub mod commands;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod exit_codes;
pub mod lock;
pub mod manager;
pub mod mode;
pub mod registry;
pub mod resource;
pub mod simulate;
pub mod wire;

#[cfg(test)]
mod test_support;

pub use error::{DlmError, Result};
pub use lock::{ConversionOutcome, HolderId, LockFlags, NodeId};
pub use manager::LockManager;
pub use mode::LockMode;
