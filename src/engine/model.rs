//! Engine (sing-box dialect) configuration document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::TlsOptions;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsConfig>,

    #[serde(default)]
    pub inbounds: Vec<Inbound>,

    #[serde(default)]
    pub outbounds: Vec<Outbound>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteConfig>,
}

impl EngineConfig {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn to_json_compact(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn outbound(&self, tag: &str) -> Option<&Outbound> {
        self.outbounds.iter().find(|o| o.tag == tag)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
    #[serde(default)]
    pub timestamp: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<DnsServer>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<DnsRule>,

    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsServer {
    #[serde(default)]
    pub tag: String,

    #[serde(default)]
    pub address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detour: Option<String>,
}

impl DnsServer {
    pub fn new(tag: &str, address: &str, detour: Option<&str>) -> Self {
        Self {
            tag: tag.to_string(),
            address: address.to_string(),
            detour: detour.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DnsRule {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geosite: Vec<String>,

    #[serde(default)]
    pub server: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inbound {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<i64>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One outbound. Protocol-specific fields without a typed slot go to `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Outbound {
    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub tag: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_port: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_encoding: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<OutboundTransport>,

    /// Members of selector/urltest groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbounds: Option<Vec<String>>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Outbound {
    pub fn new(kind: &str, tag: &str) -> Self {
        Self {
            kind: kind.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundTransport {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_early_data: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_data_header_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    #[serde(default)]
    pub rules: Vec<RouteRule>,

    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_outbound: Option<String>,

    #[serde(default)]
    pub auto_detect_interface: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_is_private: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geosite: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geoip: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,

    #[serde(default)]
    pub outbound: String,
}

impl RouteRule {
    pub fn to(outbound: &str) -> Self {
        Self {
            outbound: outbound.to_string(),
            ..Default::default()
        }
    }
}
