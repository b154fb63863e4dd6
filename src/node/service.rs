//! Node lifecycle: validate, allocate, persist, generate.
//!
//! Each step that follows a port allocation undoes it on failure, and every
//! transition is written to the node's configuration history.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::db::{
    ConfigHistory, HistoryAction, NewNode, Node, PortPurpose, Store, StoreError, PENDING_NODE_ID,
};
use crate::engine::{ConfigGenerator, GenerateOptions, GeneratedConfig, NodeDescriptor, RESERVED_TAGS};
use crate::port::{PortAllocator, PortError};
use crate::protocol::{AdapterRegistry, ProtocolParamError, ProtocolParams};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Param(#[from] ProtocolParamError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("generated config is invalid: {0}")]
    InvalidConfig(String),

    #[error("invalid node: {0}")]
    Invalid(String),

    #[error("node {0} not found")]
    NotFound(i64),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub host: String,
    pub protocol: String,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Listen port; allocated from the range when absent.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub rate: Option<f64>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub agent_token: Option<String>,
}

/// Partial update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateNodeRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub protocol: Option<String>,
    pub params: Option<Map<String, Value>>,
    pub port: Option<u16>,
    pub rate: Option<f64>,
    pub group_ids: Option<Vec<i64>>,
    pub agent_url: Option<String>,
    pub agent_token: Option<String>,
}

/// Serializable view of a node, used in API responses and history snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: i64,
    pub name: String,
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub params: Map<String, Value>,
    pub rate: f64,
    pub group_ids: Vec<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_url: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl TryFrom<&Node> for NodeView {
    type Error = serde_json::Error;

    fn try_from(node: &Node) -> Result<Self, Self::Error> {
        Ok(Self {
            id: node.id,
            name: node.name.clone(),
            protocol: node.protocol.clone(),
            host: node.host.clone(),
            port: node.port,
            params: node.params.to_canonical()?,
            rate: node.rate,
            group_ids: node.group_ids.clone(),
            agent_url: node.agent_url.clone(),
            created_at: node.created_at.to_rfc3339(),
            updated_at: node.updated_at.to_rfc3339(),
        })
    }
}

fn snapshot(node: &Node) -> Result<String, serde_json::Error> {
    let value = json!({
        "name": node.name,
        "protocol": node.protocol,
        "host": node.host,
        "port": node.port,
        "params": node.params.to_canonical()?,
        "rate": node.rate,
        "group_ids": node.group_ids,
    });
    Ok(value.to_string())
}

fn check_fields(name: &str, host: &str) -> Result<(), NodeError> {
    if name.trim().is_empty() {
        return Err(NodeError::Invalid("name must not be empty".to_string()));
    }
    if RESERVED_TAGS.contains(&name.trim()) {
        return Err(NodeError::Invalid(format!(
            "name '{}' is reserved for a built-in outbound",
            name.trim()
        )));
    }
    if host.trim().is_empty() {
        return Err(NodeError::Invalid("host must not be empty".to_string()));
    }
    Ok(())
}

pub struct NodeService {
    store: Arc<Store>,
    allocator: Arc<PortAllocator>,
    registry: Arc<AdapterRegistry>,
    generator: ConfigGenerator,
    options: GenerateOptions,
}

impl NodeService {
    pub fn new(
        store: Arc<Store>,
        allocator: Arc<PortAllocator>,
        registry: Arc<AdapterRegistry>,
        options: GenerateOptions,
    ) -> Self {
        Self {
            store,
            allocator,
            registry,
            generator: ConfigGenerator::new(),
            options,
        }
    }

    pub fn allocator(&self) -> &Arc<PortAllocator> {
        &self.allocator
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn generator(&self) -> &ConfigGenerator {
        &self.generator
    }

    fn generate(&self, node: &Node) -> GeneratedConfig {
        let descriptor = NodeDescriptor {
            tag: node.name.clone(),
            server: node.host.clone(),
            port: node.port,
            params: node.params.clone(),
        };
        self.generator.generate_config(&[descriptor], &self.options)
    }

    fn check_generated(&self, node: &Node) -> Result<(), NodeError> {
        let generated = self.generate(node);
        if generated.validation.valid {
            Ok(())
        } else {
            Err(NodeError::InvalidConfig(generated.validation.error_summary()))
        }
    }

    async fn record(
        &self,
        node_id: i64,
        action: HistoryAction,
        old: Option<&str>,
        new: Option<&str>,
        error: Option<&NodeError>,
    ) {
        let message = error.map(|e| e.to_string());
        if let Err(e) = self
            .store
            .append_history(node_id, action, old, new, message.as_deref())
            .await
        {
            warn!(node_id, error = %e, "Failed to write config history");
        }
    }

    async fn allocate(&self, port: Option<u16>, node_id: i64) -> Result<u16, PortError> {
        match port {
            Some(port) => {
                self.allocator
                    .allocate_specific_port(port, node_id, PortPurpose::Inbound)
                    .await
            }
            None => self.allocator.allocate_port(node_id, PortPurpose::Inbound).await,
        }
    }

    async fn release_quietly(&self, port: u16) {
        if let Err(e) = self.allocator.release_port(port).await {
            warn!(port, error = %e, "Failed to release port during rollback");
        }
    }

    pub async fn create_node(&self, request: CreateNodeRequest) -> Result<Node, NodeError> {
        check_fields(&request.name, &request.host)?;
        let protocol = request.protocol.to_ascii_lowercase();
        let params = self.registry.parse(&protocol, &request.params)?;

        let port = match self.allocate(request.port, PENDING_NODE_ID).await {
            Ok(port) => port,
            Err(e) => {
                let e = NodeError::from(e);
                self.record(PENDING_NODE_ID, HistoryAction::Create, None, None, Some(&e)).await;
                return Err(e);
            }
        };

        let new = NewNode {
            name: request.name,
            host: request.host,
            port,
            params,
            rate: request.rate.unwrap_or(1.0),
            group_ids: request.group_ids,
            agent_url: request.agent_url,
            agent_token: request.agent_token,
        };

        let node = match self.store.insert_node(&new).await {
            Ok(node) => node,
            Err(e) => {
                self.release_quietly(port).await;
                let e = NodeError::from(e);
                self.record(PENDING_NODE_ID, HistoryAction::Create, None, None, Some(&e)).await;
                return Err(e);
            }
        };

        let finished = async {
            self.allocator.assign_owner(port, node.id).await?;
            self.check_generated(&node)?;
            Ok::<_, NodeError>(snapshot(&node)?)
        }
        .await;

        match finished {
            Ok(new_config) => {
                self.record(node.id, HistoryAction::Create, None, Some(&new_config), None).await;
                info!(node_id = node.id, port, protocol = %node.protocol, "Created node");
                Ok(node)
            }
            Err(e) => {
                warn!(node_id = node.id, error = %e, "Node creation failed, rolling back");
                self.release_quietly(port).await;
                if let Err(err) = self.store.delete_node(node.id).await {
                    warn!(node_id = node.id, error = %err, "Failed to remove node row during rollback");
                }
                let attempted = snapshot(&node).ok();
                self.record(node.id, HistoryAction::Create, None, attempted.as_deref(), Some(&e)).await;
                Err(e)
            }
        }
    }

    pub async fn update_node(&self, id: i64, request: UpdateNodeRequest) -> Result<Node, NodeError> {
        let old = self.store.get_node(id).await?.ok_or(NodeError::NotFound(id))?;
        let old_config = snapshot(&old)?;

        let mut node = old.clone();
        if let Some(name) = request.name {
            node.name = name;
        }
        if let Some(host) = request.host {
            node.host = host;
        }
        if let Some(rate) = request.rate {
            node.rate = rate;
        }
        if let Some(group_ids) = request.group_ids {
            node.group_ids = group_ids;
        }
        if request.agent_url.is_some() {
            node.agent_url = request.agent_url.filter(|u| !u.is_empty());
        }
        if request.agent_token.is_some() {
            node.agent_token = request.agent_token.filter(|t| !t.is_empty());
        }
        check_fields(&node.name, &node.host)?;

        if request.protocol.is_some() || request.params.is_some() {
            let protocol = request
                .protocol
                .map(|p| p.to_ascii_lowercase())
                .unwrap_or_else(|| old.protocol.clone());
            let raw = match request.params {
                Some(raw) => raw,
                None => old.params.to_canonical()?,
            };
            let params = match self.registry.parse(&protocol, &raw) {
                Ok(params) => params,
                Err(e) => {
                    let e = NodeError::from(e);
                    self.record(id, HistoryAction::Update, Some(&old_config), None, Some(&e)).await;
                    return Err(e);
                }
            };
            node.protocol = params.protocol().to_string();
            node.params = params;
        }

        let port_changed = request.port.is_some_and(|p| p != old.port);
        if let Some(port) = request.port.filter(|_| port_changed) {
            if let Err(e) = self.move_port(id, old.port, port).await {
                self.record(id, HistoryAction::Update, Some(&old_config), None, Some(&e)).await;
                return Err(e);
            }
            node.port = port;
        }

        node.updated_at = chrono::Utc::now();
        let persisted = async {
            self.check_generated(&node)?;
            self.store.update_node(&node).await?;
            Ok::<_, NodeError>(snapshot(&node)?)
        }
        .await;

        match persisted {
            Ok(new_config) => {
                self.record(id, HistoryAction::Update, Some(&old_config), Some(&new_config), None).await;
                info!(node_id = id, port = node.port, "Updated node");
                Ok(node)
            }
            Err(e) => {
                if port_changed {
                    if let Err(err) = self.move_port(id, node.port, old.port).await {
                        warn!(node_id = id, error = %err, "Failed to restore previous port");
                    }
                }
                let attempted = snapshot(&node).ok();
                self.record(id, HistoryAction::Update, Some(&old_config), attempted.as_deref(), Some(&e))
                    .await;
                Err(e)
            }
        }
    }

    /// Release `from` and take `to`, re-taking `from` if `to` cannot be had.
    async fn move_port(&self, node_id: i64, from: u16, to: u16) -> Result<(), NodeError> {
        self.allocator.release_port(from).await?;
        match self
            .allocator
            .allocate_specific_port(to, node_id, PortPurpose::Inbound)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                if let Err(err) = self
                    .allocator
                    .allocate_specific_port(from, node_id, PortPurpose::Inbound)
                    .await
                {
                    warn!(node_id, port = from, error = %err, "Failed to re-allocate previous port");
                }
                Err(e.into())
            }
        }
    }

    /// Release every port of the node, then remove it. Returns the released ports.
    pub async fn delete_node(&self, id: i64) -> Result<Vec<u16>, NodeError> {
        let old = self.store.get_node(id).await?.ok_or(NodeError::NotFound(id))?;
        let old_config = snapshot(&old)?;

        let result = async {
            let released = self.allocator.release_ports_by_node(id).await?;
            self.store.delete_node(id).await?;
            Ok::<_, NodeError>(released)
        }
        .await;

        match &result {
            Ok(released) => {
                self.record(id, HistoryAction::Delete, Some(&old_config), None, None).await;
                info!(node_id = id, ports = ?released, "Deleted node");
            }
            Err(e) => {
                self.record(id, HistoryAction::Delete, Some(&old_config), None, Some(e)).await;
            }
        }
        result
    }

    pub async fn get_node(&self, id: i64) -> Result<Node, NodeError> {
        self.store.get_node(id).await?.ok_or(NodeError::NotFound(id))
    }

    pub async fn list_nodes(&self) -> Result<Vec<Node>, NodeError> {
        Ok(self.store.list_nodes().await?)
    }

    /// Engine config for a single node.
    pub async fn node_config(&self, id: i64) -> Result<GeneratedConfig, NodeError> {
        let node = self.get_node(id).await?;
        Ok(self.generate(&node))
    }

    pub async fn config_history(&self, id: i64, limit: i64) -> Result<Vec<ConfigHistory>, NodeError> {
        Ok(self.store.config_history(id, limit).await?)
    }

    /// Validate raw parameters without touching any state.
    pub fn validate_params(&self, protocol: &str, raw: &Map<String, Value>) -> Result<ProtocolParams, NodeError> {
        Ok(self.registry.parse(&protocol.to_ascii_lowercase(), raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortConfig;
    use crate::db::store::testing::temp_store;
    use crate::port::{PortHold, PortProbe};
    use std::io;
    use tempfile::TempDir;

    struct FreeProbe;

    impl PortProbe for FreeProbe {
        fn acquire(&self, _port: u16) -> io::Result<PortHold> {
            Ok(PortHold::empty())
        }
    }

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    async fn service(start: u16, end: u16) -> (NodeService, Arc<Store>, TempDir) {
        let (store, dir) = temp_store().await;
        let store = Arc::new(store);
        let range = PortConfig {
            start,
            end,
            ..Default::default()
        };
        let allocator = Arc::new(PortAllocator::new(range, store.clone(), Arc::new(FreeProbe)));
        let svc = NodeService::new(
            store.clone(),
            allocator,
            Arc::new(AdapterRegistry::with_defaults()),
            GenerateOptions::default(),
        );
        (svc, store, dir)
    }

    fn request(name: &str, host: &str) -> CreateNodeRequest {
        CreateNodeRequest {
            name: name.to_string(),
            host: host.to_string(),
            protocol: "vmess".to_string(),
            params: json!({"uuid": UUID}).as_object().cloned().unwrap(),
            port: None,
            rate: None,
            group_ids: vec![1],
            agent_url: None,
            agent_token: None,
        }
    }

    #[tokio::test]
    async fn test_create_allocates_and_records() {
        let (svc, store, _dir) = service(20000, 20010).await;
        let node = svc.create_node(request("hk", "hk.example.com")).await.unwrap();

        assert_eq!(node.port, 20000);
        assert_eq!(node.rate, 1.0);
        assert_eq!(svc.allocator().node_ports(node.id).await, vec![20000]);
        assert_eq!(store.active_port_allocations().await.unwrap()[0].node_id, node.id);

        let history = svc.config_history(node.id, 10).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].action, HistoryAction::Create);

        let generated = svc.node_config(node.id).await.unwrap();
        assert!(generated.validation.valid);
        assert!(generated.config.outbound("hk").is_some());
    }

    #[tokio::test]
    async fn test_invalid_params_allocate_nothing() {
        let (svc, _store, _dir) = service(20000, 20010).await;
        let mut req = request("hk", "hk.example.com");
        req.params = json!({"uuid": "not-a-uuid"}).as_object().cloned().unwrap();

        let err = svc.create_node(req).await.unwrap_err();
        assert!(matches!(err, NodeError::Param(ref p) if p.param == "uuid"));
        assert!(svc.allocator().used_ports().await.is_empty());
    }

    #[tokio::test]
    async fn test_reserved_names_rejected() {
        let (svc, store, _dir) = service(20000, 20010).await;
        for name in ["proxy", "auto", "direct", "block", "dns-out"] {
            let err = svc.create_node(request(name, "a.example.com")).await.unwrap_err();
            assert!(matches!(err, NodeError::Invalid(ref m) if m.contains("reserved")), "{}", name);
        }
        assert!(svc.allocator().used_ports().await.is_empty());
        assert!(store.list_nodes().await.unwrap().is_empty());

        let node = svc.create_node(request("hk", "a.example.com")).await.unwrap();
        let rename = UpdateNodeRequest {
            name: Some("direct".to_string()),
            ..Default::default()
        };
        let err = svc.update_node(node.id, rename).await.unwrap_err();
        assert!(matches!(err, NodeError::Invalid(_)));
        assert_eq!(svc.get_node(node.id).await.unwrap().name, "hk");
    }

    #[tokio::test]
    async fn test_exhaustion_surfaces_and_leaves_no_row() {
        let (svc, _store, _dir) = service(20000, 20000).await;
        svc.create_node(request("a", "a.example.com")).await.unwrap();
        let err = svc.create_node(request("b", "b.example.com")).await.unwrap_err();
        assert!(matches!(err, NodeError::Port(PortError::PortExhaustion { used: 1, .. })));
        assert_eq!(svc.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_generated_config_rolls_back() {
        let (svc, store, _dir) = service(20000, 20010).await;
        let err = svc.create_node(request("bad", "not a host")).await.unwrap_err();
        assert!(matches!(err, NodeError::InvalidConfig(_)));
        assert!(svc.allocator().used_ports().await.is_empty());
        assert!(store.list_nodes().await.unwrap().is_empty());
        assert!(store.active_port_allocations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_moves_port() {
        let (svc, _store, _dir) = service(20000, 20010).await;
        let node = svc.create_node(request("hk", "hk.example.com")).await.unwrap();

        let updated = svc
            .update_node(
                node.id,
                UpdateNodeRequest {
                    port: Some(20005),
                    rate: Some(1.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.port, 20005);
        assert_eq!(svc.allocator().node_ports(node.id).await, vec![20005]);
        assert!(svc.allocator().is_port_available(20000).await);

        let stored = svc.get_node(node.id).await.unwrap();
        assert_eq!((stored.port, stored.rate), (20005, 1.5));
        let history = svc.config_history(node.id, 10).await.unwrap();
        assert_eq!(history[0].action, HistoryAction::Update);
        assert!(history[0].old_config.is_some() && history[0].new_config.is_some());
    }

    #[tokio::test]
    async fn test_update_to_taken_port_keeps_old() {
        let (svc, _store, _dir) = service(20000, 20010).await;
        let first = svc.create_node(request("a", "a.example.com")).await.unwrap();
        let second = svc.create_node(request("b", "b.example.com")).await.unwrap();

        let err = svc
            .update_node(
                second.id,
                UpdateNodeRequest {
                    port: Some(first.port),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Port(PortError::PortConflict { .. })));
        assert_eq!(svc.allocator().node_ports(second.id).await, vec![second.port]);
        assert_eq!(svc.get_node(second.id).await.unwrap().port, second.port);

        let history = svc.config_history(second.id, 1).await.unwrap();
        assert!(!history[0].success);
    }

    #[tokio::test]
    async fn test_update_params_revalidates() {
        let (svc, _store, _dir) = service(20000, 20010).await;
        let node = svc.create_node(request("a", "a.example.com")).await.unwrap();
        let err = svc
            .update_node(
                node.id,
                UpdateNodeRequest {
                    protocol: Some("trojan".to_string()),
                    params: Some(Map::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Param(_)));

        let updated = svc
            .update_node(
                node.id,
                UpdateNodeRequest {
                    protocol: Some("trojan".to_string()),
                    params: json!({"password": "secret"}).as_object().cloned(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.protocol, "trojan");
        assert!(updated.params.tls().is_some());
    }

    #[tokio::test]
    async fn test_delete_releases_ports() {
        let (svc, _store, _dir) = service(20000, 20010).await;
        let node = svc.create_node(request("a", "a.example.com")).await.unwrap();
        let released = svc.delete_node(node.id).await.unwrap();
        assert_eq!(released, vec![node.port]);
        assert!(matches!(svc.get_node(node.id).await, Err(NodeError::NotFound(_))));
        assert!(svc.allocator().used_ports().await.is_empty());

        let history = svc.config_history(node.id, 10).await.unwrap();
        assert_eq!(history[0].action, HistoryAction::Delete);
        assert!(matches!(svc.delete_node(node.id).await, Err(NodeError::NotFound(_))));
    }
}
