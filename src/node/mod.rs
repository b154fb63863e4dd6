//! Node lifecycle orchestration.

mod service;

pub use service::{CreateNodeRequest, NodeError, NodeService, NodeView, UpdateNodeRequest};
