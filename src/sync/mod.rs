//! Node agent reconciliation and traffic collection.

pub mod agent;
mod service;

pub use agent::AgentClient;
pub use service::{NodeStatus, NodeSyncService};
