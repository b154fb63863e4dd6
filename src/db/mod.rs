//! Database module: ports, nodes, users, history and traffic.

mod models;
mod nodes;
mod ports;
pub mod store;
mod traffic;
mod users;

pub use models::{
    CommitSummary, ConfigHistory, HistoryAction, NewNode, NewUser, Node, PortAllocation,
    PortPurpose, PortStatus, TrafficBatch, TrafficPayload, User, UserTraffic, PENDING_NODE_ID,
    SYSTEM_NODE_ID,
};
pub use store::{Store, StoreError};
