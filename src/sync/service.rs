//! Reconciles node agents with central state.
//!
//! Two loops run on independent intervals: user sync pushes the expected user
//! set to every node, traffic pull drains node counters into the store.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::agent::{AgentError, NodeAgent, NodeEndpoint, RemoteStats, RemoteUser};
use crate::config::NodeConfig;
use crate::crypto::agent_secret;
use crate::db::{CommitSummary, Node, Store, StoreError, TrafficBatch, TrafficPayload, User, UserTraffic};
use crate::protocol::ProtocolParams;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),
}

/// Outcome of one user reconciliation pass on one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl SyncReport {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.deleted == 0 && self.failed == 0
    }
}

/// Live view of a node agent.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub node_id: i64,
    pub endpoint: String,
    pub online: bool,
    pub server: Option<String>,
    pub api_version: Option<String>,
    pub users: usize,
    pub uplink_bytes: i64,
    pub downlink_bytes: i64,
    pub error: Option<String>,
}

/// Secret the agent should hold for `user` on `node`.
pub fn expected_secret(node: &Node, user: &User) -> String {
    match &node.params {
        ProtocolParams::Shadowsocks(ss) => agent_secret(&ss.method, &user.uuid),
        _ => user.uuid.clone(),
    }
}

fn rated(bytes: i64, rate: f64) -> i64 {
    (bytes as f64 * rate).round() as i64
}

/// Apply the node rate to drained counters.
fn rated_payload(node: &Node, stats: &RemoteStats) -> TrafficPayload {
    let rate = node.effective_rate();
    TrafficPayload {
        protocol: node.protocol.clone(),
        rate,
        upload: rated(stats.uplink_bytes, rate),
        download: rated(stats.downlink_bytes, rate),
        users: stats
            .users
            .iter()
            .filter(|u| u.uplink_bytes > 0 || u.downlink_bytes > 0)
            .map(|u| UserTraffic {
                uuid: u.username.clone(),
                upload: rated(u.uplink_bytes, rate),
                download: rated(u.downlink_bytes, rate),
            })
            .collect(),
    }
}

fn merge(total: &mut CommitSummary, other: CommitSummary) {
    total.users_updated += other.users_updated;
    total.users_skipped += other.users_skipped;
    total.upload += other.upload;
    total.download += other.download;
}

pub struct NodeSyncService {
    store: Arc<Store>,
    agent: Arc<dyn NodeAgent>,
    config: NodeConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeSyncService {
    pub fn new(store: Arc<Store>, agent: Arc<dyn NodeAgent>, config: NodeConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            agent,
            config,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn endpoint(&self, node: &Node) -> NodeEndpoint {
        NodeEndpoint::for_node(node, &self.config)
    }

    /// Eligible users the node should carry, keyed by username.
    async fn expected_users(&self, node: &Node) -> Result<BTreeMap<String, String>, SyncError> {
        let users = self.store.users_in_groups(&node.group_ids).await?;
        let now = Utc::now();
        Ok(users
            .iter()
            .filter(|u| u.is_eligible(now))
            .map(|u| (u.uuid.clone(), expected_secret(node, u)))
            .collect())
    }

    /// Bring the node's user set in line with the expected set.
    ///
    /// Individual add/update/delete failures are logged and counted; the next
    /// cycle recomputes the diff.
    pub async fn sync_users(&self, node: &Node) -> Result<SyncReport, SyncError> {
        if node.group_ids.is_empty() {
            debug!(node_id = node.id, "Node has no groups, skipping user sync");
            return Ok(SyncReport::default());
        }
        let endpoint = self.endpoint(node);
        let expected = self.expected_users(node).await?;
        let actual: BTreeMap<String, String> = self
            .agent
            .list_users(&endpoint)
            .await?
            .into_iter()
            .map(|u| (u.username, u.secret))
            .collect();

        let mut report = SyncReport::default();

        for (username, secret) in &expected {
            match actual.get(username) {
                None => match self.agent.add_user(&endpoint, username, secret).await {
                    Ok(()) => report.added += 1,
                    Err(e) => {
                        warn!(node_id = node.id, user = %username, error = %e, "Failed to add user");
                        report.failed += 1;
                    }
                },
                Some(remote) if remote != secret => {
                    match self.agent.update_user(&endpoint, username, secret).await {
                        Ok(()) => report.updated += 1,
                        Err(e) => {
                            warn!(node_id = node.id, user = %username, error = %e, "Failed to update user");
                            report.failed += 1;
                        }
                    }
                }
                Some(_) => {}
            }
        }

        for username in actual.keys().filter(|u| !expected.contains_key(*u)) {
            match self.agent.delete_user(&endpoint, username).await {
                Ok(()) => report.deleted += 1,
                Err(e) => {
                    warn!(node_id = node.id, user = %username, error = %e, "Failed to delete user");
                    report.failed += 1;
                }
            }
        }

        if report.is_noop() {
            debug!(node_id = node.id, users = expected.len(), "Node users in sync");
        } else {
            info!(
                node_id = node.id,
                added = report.added,
                updated = report.updated,
                deleted = report.deleted,
                failed = report.failed,
                "Synced node users"
            );
        }
        Ok(report)
    }

    /// Drain node counters and apply them.
    ///
    /// Batches left staged by an earlier failure are committed first. The drained
    /// stats are staged before they are applied, so only the in-flight response
    /// can be lost.
    pub async fn pull_traffic(&self, node: &Node) -> Result<CommitSummary, SyncError> {
        let mut summary = CommitSummary::default();

        for batch in self.store.staged_traffic(node.id).await? {
            warn!(node_id = node.id, batch_id = batch.id, "Replaying staged traffic batch");
            merge(&mut summary, self.store.commit_traffic(&batch).await?);
        }

        let endpoint = self.endpoint(node);
        let stats = self.agent.get_stats(&endpoint, true).await?;
        let payload = rated_payload(node, &stats);
        if payload.upload == 0 && payload.download == 0 && payload.users.is_empty() {
            debug!(node_id = node.id, "No traffic to record");
            return Ok(summary);
        }

        let record_at = Utc::now().date_naive();
        let id = self.store.stage_traffic(node.id, record_at, &payload).await?;
        let batch = TrafficBatch {
            id,
            node_id: node.id,
            record_at,
            payload,
            created_at: Utc::now(),
        };
        merge(&mut summary, self.store.commit_traffic(&batch).await?);
        Ok(summary)
    }

    pub async fn node_status(&self, node: &Node) -> NodeStatus {
        let endpoint = self.endpoint(node);
        let mut status = NodeStatus {
            node_id: node.id,
            endpoint: endpoint.base_url.clone(),
            online: false,
            server: None,
            api_version: None,
            users: 0,
            uplink_bytes: 0,
            downlink_bytes: 0,
            error: None,
        };

        let result = async {
            let info = self.agent.info(&endpoint).await?;
            let users = self.agent.list_users(&endpoint).await?;
            let stats = self.agent.get_stats(&endpoint, false).await?;
            Ok::<_, AgentError>((info, users.len(), stats))
        }
        .await;

        match result {
            Ok((info, users, stats)) => {
                status.online = true;
                status.server = Some(info.server);
                status.api_version = Some(info.api_version);
                status.users = users;
                status.uplink_bytes = stats.uplink_bytes;
                status.downlink_bytes = stats.downlink_bytes;
            }
            Err(e) => status.error = Some(e.to_string()),
        }
        status
    }

    /// The agent's record for one user, with live counters.
    pub async fn remote_user(&self, node: &Node, uuid: &str) -> Result<Option<RemoteUser>, SyncError> {
        let endpoint = self.endpoint(node);
        Ok(self.agent.get_user(&endpoint, uuid).await?)
    }

    /// One user sync pass over every node.
    pub async fn sync_all_users(&self) -> Result<(), SyncError> {
        for node in self.store.list_nodes().await? {
            if let Err(e) = self.sync_users(&node).await {
                error!(node_id = node.id, "User sync failed: {}", e);
            }
        }
        Ok(())
    }

    /// One traffic pass over every node.
    pub async fn pull_all_traffic(&self) -> Result<(), SyncError> {
        for node in self.store.list_nodes().await? {
            if let Err(e) = self.pull_traffic(&node).await {
                error!(node_id = node.id, "Traffic pull failed: {}", e);
            }
        }
        Ok(())
    }

    /// Run both loops until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        let pull_every = self.config.pull_interval();
        let push_every = self.config.push_interval();
        info!(
            pull_interval_secs = pull_every.as_secs(),
            push_interval_secs = push_every.as_secs(),
            "Starting node sync"
        );

        let mut user_tick = ticker(pull_every);
        let mut traffic_tick = ticker(push_every);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = user_tick.tick() => {
                    if let Err(e) = self.sync_all_users().await {
                        error!("Error syncing users: {}", e);
                    }
                }
                _ = traffic_tick.tick() => {
                    if let Err(e) = self.pull_all_traffic().await {
                        error!("Error pulling traffic: {}", e);
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping node sync");
                        break;
                    }
                }
            }
        }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::testing::temp_store;
    use crate::db::NewUser;
    use crate::protocol::params::{ShadowsocksParams, VmessParams};
    use crate::sync::agent::AgentInfo;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Add(String),
        Update(String),
        Delete(String),
    }

    /// In-memory agent that applies calls to its own user table.
    #[derive(Default)]
    struct MockAgent {
        users: Mutex<HashMap<String, String>>,
        stats: Mutex<Option<RemoteStats>>,
        calls: Mutex<Vec<Call>>,
        fail_add: Mutex<Vec<String>>,
    }

    impl MockAgent {
        fn with_users(users: &[(&str, &str)]) -> Self {
            let agent = Self::default();
            *agent.users.lock().unwrap() = users
                .iter()
                .map(|(u, s)| (u.to_string(), s.to_string()))
                .collect();
            agent
        }

        fn take_calls(&self) -> Vec<Call> {
            std::mem::take(&mut *self.calls.lock().unwrap())
        }
    }

    #[async_trait]
    impl NodeAgent for MockAgent {
        async fn info(&self, _: &NodeEndpoint) -> Result<AgentInfo, AgentError> {
            Ok(AgentInfo {
                server: "mock".to_string(),
                api_version: "v1".to_string(),
            })
        }

        async fn list_users(&self, _: &NodeEndpoint) -> Result<Vec<RemoteUser>, AgentError> {
            Ok(self
                .users
                .lock()
                .unwrap()
                .iter()
                .map(|(u, s)| RemoteUser {
                    username: u.clone(),
                    secret: s.clone(),
                    ..Default::default()
                })
                .collect())
        }

        async fn get_user(&self, _: &NodeEndpoint, username: &str) -> Result<Option<RemoteUser>, AgentError> {
            Ok(self.users.lock().unwrap().get(username).map(|s| RemoteUser {
                username: username.to_string(),
                secret: s.clone(),
                ..Default::default()
            }))
        }

        async fn add_user(&self, _: &NodeEndpoint, username: &str, secret: &str) -> Result<(), AgentError> {
            if self.fail_add.lock().unwrap().iter().any(|u| u == username) {
                return Err(AgentError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            self.calls.lock().unwrap().push(Call::Add(username.to_string()));
            self.users
                .lock()
                .unwrap()
                .insert(username.to_string(), secret.to_string());
            Ok(())
        }

        async fn update_user(&self, _: &NodeEndpoint, username: &str, secret: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(Call::Update(username.to_string()));
            self.users
                .lock()
                .unwrap()
                .insert(username.to_string(), secret.to_string());
            Ok(())
        }

        async fn delete_user(&self, _: &NodeEndpoint, username: &str) -> Result<(), AgentError> {
            self.calls.lock().unwrap().push(Call::Delete(username.to_string()));
            self.users.lock().unwrap().remove(username);
            Ok(())
        }

        async fn get_stats(&self, _: &NodeEndpoint, clear: bool) -> Result<RemoteStats, AgentError> {
            let mut stats = self.stats.lock().unwrap();
            let current = stats.clone().unwrap_or_default();
            if clear {
                *stats = None;
            }
            Ok(current)
        }
    }

    fn node(params: ProtocolParams, rate: f64) -> Node {
        Node {
            id: 3,
            name: "node".to_string(),
            protocol: params.protocol().to_string(),
            host: "10.0.0.3".to_string(),
            port: 443,
            params,
            rate,
            group_ids: vec![1],
            agent_url: None,
            agent_token: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn vmess_node() -> Node {
        node(
            ProtocolParams::Vmess(VmessParams {
                uuid: String::new(),
                alter_id: 0,
                security: "auto".to_string(),
                tls: None,
                transport: None,
            }),
            2.0,
        )
    }

    async fn user(store: &Store, uuid: &str, group_id: i64) -> User {
        let new = NewUser {
            uuid: Some(uuid.to_string()),
            group_id: Some(group_id),
            ..Default::default()
        };
        store.create_user(&new).await.unwrap().1
    }

    const A: &str = "aaaaaaaa-0000-4000-8000-000000000001";
    const B: &str = "bbbbbbbb-0000-4000-8000-000000000002";
    const C: &str = "cccccccc-0000-4000-8000-000000000003";

    async fn service(agent: Arc<MockAgent>) -> (NodeSyncService, Arc<Store>, TempDir) {
        let (store, dir) = temp_store().await;
        let store = Arc::new(store);
        let svc = NodeSyncService::new(store.clone(), agent, NodeConfig::default());
        (svc, store, dir)
    }

    #[tokio::test]
    async fn test_sync_issues_minimal_diff() {
        let agent = Arc::new(MockAgent::with_users(&[(A, A), (B, B)]));
        let (svc, store, _dir) = service(agent.clone()).await;
        user(&store, A, 1).await;
        user(&store, C, 1).await;

        let report = svc.sync_users(&vmess_node()).await.unwrap();
        assert_eq!(agent.take_calls(), vec![Call::Add(C.to_string()), Call::Delete(B.to_string())]);
        assert_eq!((report.added, report.updated, report.deleted), (1, 0, 1));
    }

    #[tokio::test]
    async fn test_second_sync_is_noop() {
        let agent = Arc::new(MockAgent::with_users(&[(B, B)]));
        let (svc, store, _dir) = service(agent.clone()).await;
        user(&store, A, 1).await;
        user(&store, C, 2).await;

        svc.sync_users(&vmess_node()).await.unwrap();
        agent.take_calls();

        let report = svc.sync_users(&vmess_node()).await.unwrap();
        assert!(report.is_noop());
        assert!(agent.take_calls().is_empty());
    }

    #[tokio::test]
    async fn test_node_without_groups_gets_no_users() {
        let agent = Arc::new(MockAgent::default());
        let (svc, store, _dir) = service(agent.clone()).await;
        user(&store, A, 5).await;

        let mut groupless = vmess_node();
        groupless.group_ids = vec![];
        let report = svc.sync_users(&groupless).await.unwrap();

        assert!(report.is_noop());
        assert!(agent.take_calls().is_empty());
        assert!(agent.users.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_user_lookup() {
        let agent = Arc::new(MockAgent::with_users(&[(A, "k")]));
        let (svc, _store, _dir) = service(agent).await;

        let found = svc.remote_user(&vmess_node(), A).await.unwrap().unwrap();
        assert_eq!(found.secret, "k");
        assert!(svc.remote_user(&vmess_node(), B).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_changed_secret_is_updated_and_ineligible_removed() {
        let ss = node(
            ProtocolParams::Shadowsocks(ShadowsocksParams {
                method: "2022-blake3-aes-128-gcm".to_string(),
                password: "c2VydmVyLXBzay0xMjM0NQ==".to_string(),
                plugin: None,
                plugin_opts: None,
            }),
            1.0,
        );
        let agent = Arc::new(MockAgent::with_users(&[(A, A), (B, B)]));
        let (svc, store, _dir) = service(agent.clone()).await;
        user(&store, A, 1).await;
        let banned = user(&store, B, 1).await;
        store.set_user_banned(banned.id, true).await.unwrap();

        svc.sync_users(&ss).await.unwrap();
        assert_eq!(agent.take_calls(), vec![Call::Update(A.to_string()), Call::Delete(B.to_string())]);
        let remote = agent.users.lock().unwrap().get(A).cloned().unwrap();
        assert_eq!(remote, agent_secret("2022-blake3-aes-128-gcm", A));
    }

    #[tokio::test]
    async fn test_failed_call_does_not_stop_batch() {
        let agent = Arc::new(MockAgent::with_users(&[(B, B)]));
        agent.fail_add.lock().unwrap().push(A.to_string());
        let (svc, store, _dir) = service(agent.clone()).await;
        user(&store, A, 1).await;
        user(&store, C, 1).await;

        let report = svc.sync_users(&vmess_node()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.added, 1);
        assert_eq!(report.deleted, 1);
    }

    #[tokio::test]
    async fn test_pull_traffic_applies_rate() {
        let agent = Arc::new(MockAgent::default());
        *agent.stats.lock().unwrap() = Some(RemoteStats {
            uplink_bytes: 150,
            downlink_bytes: 300,
            users: vec![RemoteUser {
                username: A.to_string(),
                uplink_bytes: 100,
                downlink_bytes: 200,
                ..Default::default()
            }],
        });
        let (svc, store, _dir) = service(agent.clone()).await;
        let a = user(&store, A, 1).await;

        let summary = svc.pull_traffic(&vmess_node()).await.unwrap();
        assert_eq!(summary.users_updated, 1);
        assert_eq!((summary.upload, summary.download), (300, 600));

        let a = store.get_user(a.id).await.unwrap().unwrap();
        assert_eq!((a.u, a.d), (200, 400));
        assert!(store.staged_traffic(3).await.unwrap().is_empty());

        // counters were cleared on the agent
        let again = svc.pull_traffic(&vmess_node()).await.unwrap();
        assert_eq!(again, CommitSummary::default());
    }

    #[tokio::test]
    async fn test_pull_traffic_replays_staged_batch() {
        let agent = Arc::new(MockAgent::default());
        let (svc, store, _dir) = service(agent).await;
        let a = user(&store, A, 1).await;
        let payload = TrafficPayload {
            protocol: "vmess".to_string(),
            rate: 1.0,
            upload: 10,
            download: 20,
            users: vec![UserTraffic {
                uuid: A.to_string(),
                upload: 10,
                download: 20,
            }],
        };
        store.stage_traffic(3, Utc::now().date_naive(), &payload).await.unwrap();

        let summary = svc.pull_traffic(&vmess_node()).await.unwrap();
        assert_eq!(summary.users_updated, 1);
        let a = store.get_user(a.id).await.unwrap().unwrap();
        assert_eq!((a.u, a.d), (10, 20));
    }

    #[tokio::test]
    async fn test_node_status_reports_agent() {
        let agent = Arc::new(MockAgent::with_users(&[(A, A)]));
        let (svc, _store, _dir) = service(agent).await;
        let status = svc.node_status(&vmess_node()).await;
        assert!(status.online);
        assert_eq!(status.users, 1);
        assert_eq!(status.api_version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let agent = Arc::new(MockAgent::default());
        let (svc, _store, _dir) = service(agent).await;
        let svc = Arc::new(svc);
        let handle = tokio::spawn({
            let svc = svc.clone();
            async move { svc.run().await }
        });
        svc.stop();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_rate_rounding() {
        assert_eq!(rated(3, 1.5), 5);
        assert_eq!(rated(100, 0.5), 50);
    }
}
