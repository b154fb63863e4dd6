//! Client for the node agent REST API (`/server/v1`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::NodeConfig;
use crate::db::Node;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("agent returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// How to reach one node's agent.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEndpoint {
    pub base_url: String,
    pub token: Option<String>,
}

impl NodeEndpoint {
    /// Endpoint for `node`, falling back to `http://{host}:{agent_port}/{protocol}`
    /// and the configured default token.
    pub fn for_node(node: &Node, config: &NodeConfig) -> Self {
        let base_url = match node.agent_url.as_deref() {
            Some(url) if !url.is_empty() => url.trim_end_matches('/').to_string(),
            _ if node.host.contains(':') => {
                format!("http://[{}]:{}/{}", node.host, config.agent_port, node.protocol)
            }
            _ => format!("http://{}:{}/{}", node.host, config.agent_port, node.protocol),
        };
        Self {
            base_url,
            token: node.agent_token.clone().or_else(|| config.agent_token.clone()),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/server/v1{}", self.base_url, path)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    #[serde(default)]
    pub server: String,
    #[serde(default)]
    pub api_version: String,
}

/// A user as reported by the agent. `username` is the user's uuid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteUser {
    pub username: String,
    #[serde(rename = "uPSK", default)]
    pub secret: String,
    #[serde(rename = "uplinkBytes", default)]
    pub uplink_bytes: i64,
    #[serde(rename = "downlinkBytes", default)]
    pub downlink_bytes: i64,
    #[serde(rename = "uplinkPackets", default)]
    pub uplink_packets: i64,
    #[serde(rename = "downlinkPackets", default)]
    pub downlink_packets: i64,
    #[serde(rename = "tcpSessions", default)]
    pub tcp_sessions: i64,
    #[serde(rename = "udpSessions", default)]
    pub udp_sessions: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteStats {
    #[serde(rename = "uplinkBytes", default)]
    pub uplink_bytes: i64,
    #[serde(rename = "downlinkBytes", default)]
    pub downlink_bytes: i64,
    #[serde(default)]
    pub users: Vec<RemoteUser>,
}

#[derive(Deserialize)]
struct UserList {
    #[serde(default)]
    users: Vec<RemoteUser>,
}

#[derive(Serialize)]
struct UserBody<'a> {
    username: &'a str,
    #[serde(rename = "uPSK")]
    secret: &'a str,
}

/// Operations the sync service needs from a node.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    async fn info(&self, endpoint: &NodeEndpoint) -> Result<AgentInfo, AgentError>;

    async fn list_users(&self, endpoint: &NodeEndpoint) -> Result<Vec<RemoteUser>, AgentError>;

    /// `None` when the agent does not know the user.
    async fn get_user(&self, endpoint: &NodeEndpoint, username: &str)
        -> Result<Option<RemoteUser>, AgentError>;

    async fn add_user(&self, endpoint: &NodeEndpoint, username: &str, secret: &str)
        -> Result<(), AgentError>;

    async fn update_user(&self, endpoint: &NodeEndpoint, username: &str, secret: &str)
        -> Result<(), AgentError>;

    async fn delete_user(&self, endpoint: &NodeEndpoint, username: &str) -> Result<(), AgentError>;

    /// Counters since the last clear. `clear` resets them on the agent.
    async fn get_stats(&self, endpoint: &NodeEndpoint, clear: bool) -> Result<RemoteStats, AgentError>;
}

/// reqwest-backed agent client.
#[derive(Debug, Clone)]
pub struct AgentClient {
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("nodeplane/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn request(&self, method: reqwest::Method, endpoint: &NodeEndpoint, path: &str) -> reqwest::RequestBuilder {
        let url = endpoint.url(path);
        debug!(%method, url = %url, "Agent request");
        let builder = self.client.request(method, url);
        match endpoint.token.as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, AgentError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn user_path(username: &str) -> String {
    format!("/users/{}", urlencoding::encode(username))
}

#[async_trait]
impl NodeAgent for AgentClient {
    async fn info(&self, endpoint: &NodeEndpoint) -> Result<AgentInfo, AgentError> {
        let response = self.request(reqwest::Method::GET, endpoint, "/").send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn list_users(&self, endpoint: &NodeEndpoint) -> Result<Vec<RemoteUser>, AgentError> {
        let response = self.request(reqwest::Method::GET, endpoint, "/users").send().await?;
        let list: UserList = Self::check(response).await?.json().await?;
        Ok(list.users)
    }

    async fn get_user(
        &self,
        endpoint: &NodeEndpoint,
        username: &str,
    ) -> Result<Option<RemoteUser>, AgentError> {
        let response = self
            .request(reqwest::Method::GET, endpoint, &user_path(username))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(Self::check(response).await?.json().await?))
    }

    async fn add_user(&self, endpoint: &NodeEndpoint, username: &str, secret: &str) -> Result<(), AgentError> {
        let response = self
            .request(reqwest::Method::POST, endpoint, "/users")
            .json(&UserBody { username, secret })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_user(&self, endpoint: &NodeEndpoint, username: &str, secret: &str) -> Result<(), AgentError> {
        let response = self
            .request(reqwest::Method::PUT, endpoint, &user_path(username))
            .json(&UserBody { username, secret })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete_user(&self, endpoint: &NodeEndpoint, username: &str) -> Result<(), AgentError> {
        let response = self
            .request(reqwest::Method::DELETE, endpoint, &user_path(username))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn get_stats(&self, endpoint: &NodeEndpoint, clear: bool) -> Result<RemoteStats, AgentError> {
        let path = if clear { "/stats?clear=true" } else { "/stats" };
        let response = self.request(reqwest::Method::GET, endpoint, path).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }
}
