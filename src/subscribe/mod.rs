//! Subscription rendering for client ecosystems.
//!
//! Every format works from the same [`ProxyDescriptor`] list: a node's typed
//! parameters with the subscriber's credential substituted. Protocols a format
//! cannot express are left out of that format's output.

mod clash;
mod quantumult;
mod singbox;
mod surge;
mod uri;

use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use thiserror::Error;

use crate::crypto::client_password;
use crate::db::{Node, User};
use crate::engine::GenerateOptions;
use crate::protocol::ProtocolParams;

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown subscription format: {0}")]
    UnknownFormat(String),
}

/// A node as offered to subscribers.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub params: ProtocolParams,
}

impl From<&Node> for ServerInfo {
    fn from(node: &Node) -> Self {
        Self {
            name: node.name.clone(),
            host: node.host.clone(),
            port: node.port,
            params: node.params.clone(),
        }
    }
}

/// One server with the subscriber's credential filled in.
#[derive(Debug, Clone)]
pub struct ProxyDescriptor {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub params: ProtocolParams,
}

impl ProxyDescriptor {
    pub fn for_user(server: &ServerInfo, user: &User) -> Self {
        let password = match &server.params {
            ProtocolParams::Shadowsocks(ss) => client_password(&ss.method, &ss.password, &user.uuid),
            _ => user.uuid.clone(),
        };
        Self {
            name: server.name.clone(),
            server: server.host.clone(),
            port: server.port,
            params: server.params.with_credential(&user.uuid, &password),
        }
    }
}

pub fn descriptors(servers: &[ServerInfo], user: &User) -> Vec<ProxyDescriptor> {
    servers
        .iter()
        .map(|s| ProxyDescriptor::for_user(s, user))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    SingBox,
    Clash,
    ClashMeta,
    Surge,
    Surfboard,
    QuantumultX,
    Loon,
    Base64,
}

/// User-Agent substrings, checked in order against the lowercased header.
const USER_AGENTS: &[(&str, Format)] = &[
    ("clash.meta", Format::ClashMeta),
    ("clash-meta", Format::ClashMeta),
    ("mihomo", Format::ClashMeta),
    ("clash-verge", Format::ClashMeta),
    ("stash", Format::ClashMeta),
    ("clash", Format::Clash),
    ("sing-box", Format::SingBox),
    ("sfa", Format::SingBox),
    ("sfi", Format::SingBox),
    ("sfm", Format::SingBox),
    ("surfboard", Format::Surfboard),
    ("surge", Format::Surge),
    ("quantumult", Format::QuantumultX),
    ("loon", Format::Loon),
];

impl Format {
    pub const ALL: &'static [Format] = &[
        Format::SingBox,
        Format::Clash,
        Format::ClashMeta,
        Format::Surge,
        Format::Surfboard,
        Format::QuantumultX,
        Format::Loon,
        Format::Base64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Format::SingBox => "singbox",
            Format::Clash => "clash",
            Format::ClashMeta => "clashmeta",
            Format::Surge => "surge",
            Format::Surfboard => "surfboard",
            Format::QuantumultX => "quantumultx",
            Format::Loon => "loon",
            Format::Base64 => "base64",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Format::SingBox => "application/json; charset=utf-8",
            Format::Clash | Format::ClashMeta => "text/yaml; charset=utf-8",
            _ => "text/plain; charset=utf-8",
        }
    }

    pub fn from_user_agent(user_agent: &str) -> Option<Self> {
        let ua = user_agent.to_ascii_lowercase();
        USER_AGENTS
            .iter()
            .find(|(needle, _)| ua.contains(needle))
            .map(|(_, format)| *format)
    }

    /// Explicit format wins, then the User-Agent, then the base64 bundle.
    pub fn select(format: Option<&str>, user_agent: Option<&str>) -> Self {
        if let Some(format) = format.and_then(|f| f.parse().ok()) {
            return format;
        }
        user_agent
            .and_then(Self::from_user_agent)
            .unwrap_or(Format::Base64)
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Format {
    type Err = SubscribeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "singbox" | "sing-box" | "sing_box" => Ok(Format::SingBox),
            "clash" => Ok(Format::Clash),
            "clashmeta" | "clash-meta" | "clash.meta" | "meta" | "mihomo" => Ok(Format::ClashMeta),
            "surge" => Ok(Format::Surge),
            "surfboard" => Ok(Format::Surfboard),
            "quantumultx" | "quantumult-x" | "quantumult" | "qx" => Ok(Format::QuantumultX),
            "loon" => Ok(Format::Loon),
            "base64" | "v2ray" | "uri" | "shadowrocket" => Ok(Format::Base64),
            other => Err(SubscribeError::UnknownFormat(other.to_string())),
        }
    }
}

/// A rendered subscription body.
#[derive(Debug, Clone)]
pub struct Rendered {
    pub format: Format,
    pub content_type: &'static str,
    pub body: String,
}

pub fn render(
    format: Format,
    servers: &[ServerInfo],
    user: &User,
    options: &GenerateOptions,
) -> Result<Rendered, SubscribeError> {
    let proxies = descriptors(servers, user);
    let body = match format {
        Format::SingBox => singbox::render(&proxies, options)?,
        Format::Clash => clash::render(&proxies, false)?,
        Format::ClashMeta => clash::render(&proxies, true)?,
        Format::Surge => surge::render(&proxies, surge::Flavor::Surge),
        Format::Surfboard => surge::render(&proxies, surge::Flavor::Surfboard),
        Format::QuantumultX => quantumult::render_quantumult_x(&proxies),
        Format::Loon => quantumult::render_loon(&proxies),
        Format::Base64 => uri::render(&proxies),
    };
    Ok(Rendered {
        format,
        content_type: format.content_type(),
        body,
    })
}

/// Value of the `subscription-userinfo` response header.
pub fn subscription_userinfo(user: &User) -> String {
    let expire = user.expired_at.map(|t| t.timestamp()).unwrap_or(0);
    format!(
        "upload={}; download={}; total={}; expire={}",
        user.u, user.d, user.transfer_enable, expire
    )
}

/// Servers offered to `user`, or nothing if the user may not connect.
pub fn servers_for_user(nodes: &[Node], user: &User) -> Vec<ServerInfo> {
    if !user.is_eligible(Utc::now()) {
        return Vec::new();
    }
    nodes
        .iter()
        .filter(|n| n.serves_group(user.group_id))
        .map(ServerInfo::from)
        .collect()
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn authority(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::protocol::params::{
        AnyTlsParams, Hysteria2Params, Network, RealityOptions, ShadowsocksParams, TlsOptions,
        Transport, TrojanParams, TuicParams, VlessParams, VmessParams,
    };

    pub const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    pub fn user() -> User {
        User {
            id: 1,
            uuid: UUID.to_string(),
            token_hash: String::new(),
            group_id: Some(1),
            transfer_enable: 10_000,
            u: 100,
            d: 200,
            banned: false,
            expired_at: None,
            speed_limit: None,
            created_at: Utc::now(),
        }
    }

    fn tls(sni: &str) -> TlsOptions {
        TlsOptions {
            server_name: Some(sni.to_string()),
            ..TlsOptions::enabled()
        }
    }

    pub fn servers() -> Vec<ServerInfo> {
        let mut ws = Transport::new(Network::Ws);
        ws.path = Some("/ray".to_string());
        ws.host = vec!["cdn.example.com".to_string()];

        let mut reality = tls("www.example.com");
        reality.reality = Some(RealityOptions {
            enabled: true,
            public_key: "pubkey".to_string(),
            short_id: "ab12".to_string(),
        });

        vec![
            ServerInfo {
                name: "hk-vmess".to_string(),
                host: "hk.example.com".to_string(),
                port: 443,
                params: ProtocolParams::Vmess(VmessParams {
                    uuid: String::new(),
                    alter_id: 0,
                    security: "auto".to_string(),
                    tls: Some(tls("hk.example.com")),
                    transport: Some(ws),
                }),
            },
            ServerInfo {
                name: "jp-vless".to_string(),
                host: "jp.example.com".to_string(),
                port: 443,
                params: ProtocolParams::Vless(VlessParams {
                    uuid: String::new(),
                    flow: "xtls-rprx-vision".to_string(),
                    encryption: "none".to_string(),
                    packet_encoding: "xudp".to_string(),
                    tls: Some(reality),
                    transport: None,
                }),
            },
            ServerInfo {
                name: "us-trojan".to_string(),
                host: "us.example.com".to_string(),
                port: 8443,
                params: ProtocolParams::Trojan(TrojanParams {
                    password: String::new(),
                    tls: tls("us.example.com"),
                    transport: None,
                }),
            },
            ServerInfo {
                name: "sg-ss".to_string(),
                host: "sg.example.com".to_string(),
                port: 8388,
                params: ProtocolParams::Shadowsocks(ShadowsocksParams {
                    method: "aes-256-gcm".to_string(),
                    password: String::new(),
                    plugin: None,
                    plugin_opts: None,
                }),
            },
            ServerInfo {
                name: "de-ss2022".to_string(),
                host: "de.example.com".to_string(),
                port: 8389,
                params: ProtocolParams::Shadowsocks(ShadowsocksParams {
                    method: "2022-blake3-aes-128-gcm".to_string(),
                    password: "c2VydmVyLXBzay0xMjM0NQ==".to_string(),
                    plugin: None,
                    plugin_opts: None,
                }),
            },
            ServerInfo {
                name: "kr-hy2".to_string(),
                host: "kr.example.com".to_string(),
                port: 8443,
                params: ProtocolParams::Hysteria2(Hysteria2Params {
                    password: String::new(),
                    obfs_password: Some("obfs".to_string()),
                    up_mbps: Some(50),
                    down_mbps: Some(200),
                    tls: tls("kr.example.com"),
                }),
            },
            ServerInfo {
                name: "tw-tuic".to_string(),
                host: "tw.example.com".to_string(),
                port: 9443,
                params: ProtocolParams::Tuic(TuicParams {
                    uuid: String::new(),
                    password: String::new(),
                    congestion_control: "bbr".to_string(),
                    udp_relay_mode: "native".to_string(),
                    tls: tls("tw.example.com"),
                }),
            },
            ServerInfo {
                name: "uk-anytls".to_string(),
                host: "uk.example.com".to_string(),
                port: 443,
                params: ProtocolParams::AnyTls(AnyTlsParams {
                    password: String::new(),
                    tls: tls("uk.example.com"),
                }),
            },
        ]
    }

    pub fn proxies() -> Vec<ProxyDescriptor> {
        descriptors(&servers(), &user())
    }
}
