//! Database model definitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolParams;

/// Node id owning ports found bound on the host by the startup scan.
pub const SYSTEM_NODE_ID: i64 = -1;

/// Node id for a reservation whose node row does not exist yet.
pub const PENDING_NODE_ID: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortPurpose {
    Inbound,
    Outbound,
    System,
}

impl PortPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortPurpose::Inbound => "inbound",
            PortPurpose::Outbound => "outbound",
            PortPurpose::System => "system",
        }
    }
}

impl fmt::Display for PortPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for PortPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(PortPurpose::Inbound),
            "outbound" => Ok(PortPurpose::Outbound),
            "system" => Ok(PortPurpose::System),
            other => Err(format!("unknown port purpose: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Allocated,
    Released,
}

impl PortStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortStatus::Allocated => "allocated",
            PortStatus::Released => "released",
        }
    }
}

impl FromStr for PortStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "allocated" => Ok(PortStatus::Allocated),
            "released" => Ok(PortStatus::Released),
            other => Err(format!("unknown port status: {}", other)),
        }
    }
}

/// A local port held for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub node_id: i64,
    pub purpose: PortPurpose,
    pub status: PortStatus,
    pub allocated_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl PortAllocation {
    pub fn new(port: u16, node_id: i64, purpose: PortPurpose) -> Self {
        Self {
            port,
            node_id,
            purpose,
            status: PortStatus::Allocated,
            allocated_at: Utc::now(),
            released_at: None,
        }
    }
}

/// Row counts for the port table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortUsageStats {
    pub allocated: i64,
    pub released: i64,
    pub nodes: i64,
}

/// A proxy node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: i64,
    pub name: String,
    pub protocol: String,
    pub host: String,
    /// Public port clients connect to.
    pub port: u16,
    pub params: ProtocolParams,
    pub rate: f64,
    pub group_ids: Vec<i64>,
    pub agent_url: Option<String>,
    pub agent_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Traffic multiplier, never below 1 when unset or non-positive.
    pub fn effective_rate(&self) -> f64 {
        normalize_rate(self.rate)
    }

    /// Whether a user in `group_id` may use this node. A node without groups
    /// serves nobody.
    pub fn serves_group(&self, group_id: Option<i64>) -> bool {
        group_id.map(|g| self.group_ids.contains(&g)).unwrap_or(false)
    }
}

pub fn normalize_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 {
        rate
    } else {
        1.0
    }
}

/// Fields for inserting a node.
#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub params: ProtocolParams,
    pub rate: f64,
    pub group_ids: Vec<i64>,
    pub agent_url: Option<String>,
    pub agent_token: Option<String>,
}

/// A subscriber.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub uuid: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    pub group_id: Option<i64>,
    /// Quota in bytes, 0 for unlimited.
    pub transfer_enable: i64,
    pub u: i64,
    pub d: i64,
    pub banned: bool,
    pub expired_at: Option<DateTime<Utc>>,
    pub speed_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn used_traffic(&self) -> i64 {
        self.u + self.d
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.banned {
            return false;
        }
        if self.transfer_enable != 0 && self.used_traffic() >= self.transfer_enable {
            return false;
        }
        if let Some(expired_at) = self.expired_at {
            if expired_at <= now {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub uuid: Option<String>,
    pub group_id: Option<i64>,
    pub transfer_enable: i64,
    pub expired_at: Option<DateTime<Utc>>,
    pub speed_limit: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryAction {
    Create,
    Update,
    Delete,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Create => "create",
            HistoryAction::Update => "update",
            HistoryAction::Delete => "delete",
        }
    }
}

impl FromStr for HistoryAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(HistoryAction::Create),
            "update" => Ok(HistoryAction::Update),
            "delete" => Ok(HistoryAction::Delete),
            other => Err(format!("unknown history action: {}", other)),
        }
    }
}

/// Append-only record of a node lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigHistory {
    pub id: i64,
    pub node_id: i64,
    pub action: HistoryAction,
    pub old_config: Option<String>,
    pub new_config: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Rated traffic for one user within a drained batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserTraffic {
    pub uuid: String,
    pub upload: i64,
    pub download: i64,
}

/// Rated traffic drained from one node, applied atomically on commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficPayload {
    pub protocol: String,
    pub rate: f64,
    pub upload: i64,
    pub download: i64,
    pub users: Vec<UserTraffic>,
}

/// A staged (drained but not yet applied) batch.
#[derive(Debug, Clone)]
pub struct TrafficBatch {
    pub id: i64,
    pub node_id: i64,
    pub record_at: NaiveDate,
    pub payload: TrafficPayload,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CommitSummary {
    pub users_updated: usize,
    pub users_skipped: usize,
    pub upload: i64,
    pub download: i64,
}

/// Daily per-user traffic row.
#[derive(Debug, Clone, Serialize)]
pub struct UserDailyStat {
    pub user_id: i64,
    pub server_rate: f64,
    pub record_at: NaiveDate,
    pub u: i64,
    pub d: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn user() -> User {
        User {
            id: 1,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".to_string(),
            token_hash: String::new(),
            group_id: Some(1),
            transfer_enable: 1000,
            u: 100,
            d: 200,
            banned: false,
            expired_at: None,
            speed_limit: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_eligibility() {
        let now = Utc::now();
        assert!(user().is_eligible(now));

        let banned = User { banned: true, ..user() };
        assert!(!banned.is_eligible(now));

        let exhausted = User { u: 600, d: 400, ..user() };
        assert!(!exhausted.is_eligible(now));

        let unlimited = User { transfer_enable: 0, u: i64::MAX / 2, ..user() };
        assert!(unlimited.is_eligible(now));

        let expired = User { expired_at: Some(now - Duration::seconds(1)), ..user() };
        assert!(!expired.is_eligible(now));

        let future = User { expired_at: Some(now + Duration::days(1)), ..user() };
        assert!(future.is_eligible(now));
    }

    #[test]
    fn test_rate_normalization() {
        assert_eq!(normalize_rate(0.0), 1.0);
        assert_eq!(normalize_rate(-2.0), 1.0);
        assert_eq!(normalize_rate(f64::NAN), 1.0);
        assert_eq!(normalize_rate(1.5), 1.5);
    }

    #[test]
    fn test_purpose_parsing() {
        assert_eq!("system".parse::<PortPurpose>().unwrap(), PortPurpose::System);
        assert!("web".parse::<PortPurpose>().is_err());
        assert_eq!(PortPurpose::Inbound.to_string(), "inbound");
    }
}
