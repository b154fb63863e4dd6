//! Typed canonical parameters, one struct per protocol.
//!
//! The canonical map an adapter produces is exactly the serde representation of
//! these structs, so a node row can always be loaded back into its variant.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ProtocolParamError;

fn default_true() -> bool {
    true
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// TLS settings shared by all TLS-capable protocols.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utls: Option<UtlsOptions>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityOptions>,
}

impl TlsOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            server_name: None,
            insecure: false,
            alpn: Vec::new(),
            utls: None,
            reality: None,
        }
    }

    pub fn reality(&self) -> Option<&RealityOptions> {
        self.reality.as_ref().filter(|r| r.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtlsOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealityOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub short_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Ws,
    Grpc,
    H2,
    Quic,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::H2 => "h2",
            Network::Quic => "quic",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tcp" => Some(Network::Tcp),
            "ws" => Some(Network::Ws),
            "grpc" => Some(Network::Grpc),
            "h2" | "http" => Some(Network::H2),
            "quic" => Some(Network::Quic),
            _ => None,
        }
    }
}

/// Normalized transport. Plain TCP without header obfuscation has none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transport {
    #[serde(rename = "type")]
    pub network: Network,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<String>,
}

impl Transport {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            path: None,
            host: Vec::new(),
            service_name: None,
            header_type: None,
            security: None,
        }
    }

    pub fn first_host(&self) -> Option<&str> {
        self.host.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmessParams {
    pub uuid: String,
    pub alter_id: u16,
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VlessParams {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flow: String,
    pub encryption: String,
    pub packet_encoding: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrojanParams {
    pub password: String,
    pub tls: TlsOptions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksParams {
    pub method: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_opts: Option<String>,
}

impl ShadowsocksParams {
    /// Parse `plugin_opts` ("obfs=http;obfs-host=example.com") into pairs.
    pub fn plugin_options(&self) -> Vec<(String, String)> {
        self.plugin_opts
            .as_deref()
            .unwrap_or_default()
            .split(';')
            .filter_map(|pair| {
                let (k, v) = pair.split_once('=')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect()
    }

    pub fn plugin_option(&self, key: &str) -> Option<String> {
        self.plugin_options()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteriaParams {
    pub password: String,
    pub up_mbps: u32,
    pub down_mbps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs: Option<String>,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hysteria2Params {
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_mbps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_mbps: Option<u32>,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuicParams {
    pub uuid: String,
    pub password: String,
    pub congestion_control: String,
    pub udp_relay_mode: String,
    pub tls: TlsOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnyTlsParams {
    pub password: String,
    pub tls: TlsOptions,
}

/// Tagged union over all supported protocols.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolParams {
    Vmess(VmessParams),
    Vless(VlessParams),
    Trojan(TrojanParams),
    Shadowsocks(ShadowsocksParams),
    Hysteria(HysteriaParams),
    Hysteria2(Hysteria2Params),
    Tuic(TuicParams),
    AnyTls(AnyTlsParams),
}

impl ProtocolParams {
    pub fn protocol(&self) -> &'static str {
        match self {
            ProtocolParams::Vmess(_) => "vmess",
            ProtocolParams::Vless(_) => "vless",
            ProtocolParams::Trojan(_) => "trojan",
            ProtocolParams::Shadowsocks(_) => "shadowsocks",
            ProtocolParams::Hysteria(_) => "hysteria",
            ProtocolParams::Hysteria2(_) => "hysteria2",
            ProtocolParams::Tuic(_) => "tuic",
            ProtocolParams::AnyTls(_) => "anytls",
        }
    }

    /// Load a canonical map produced by an adapter.
    pub fn from_canonical(protocol: &str, map: &Map<String, Value>) -> Result<Self, ProtocolParamError> {
        let value = Value::Object(map.clone());
        let invalid = |e: serde_json::Error| {
            ProtocolParamError::invalid(protocol, "params", format!("malformed canonical params: {}", e))
        };
        let params = match protocol {
            "vmess" => ProtocolParams::Vmess(serde_json::from_value(value).map_err(invalid)?),
            "vless" => ProtocolParams::Vless(serde_json::from_value(value).map_err(invalid)?),
            "trojan" => ProtocolParams::Trojan(serde_json::from_value(value).map_err(invalid)?),
            "shadowsocks" => {
                ProtocolParams::Shadowsocks(serde_json::from_value(value).map_err(invalid)?)
            }
            "hysteria" => ProtocolParams::Hysteria(serde_json::from_value(value).map_err(invalid)?),
            "hysteria2" => {
                ProtocolParams::Hysteria2(serde_json::from_value(value).map_err(invalid)?)
            }
            "tuic" => ProtocolParams::Tuic(serde_json::from_value(value).map_err(invalid)?),
            "anytls" => ProtocolParams::AnyTls(serde_json::from_value(value).map_err(invalid)?),
            other => return Err(ProtocolParamError::unsupported(other)),
        };
        Ok(params)
    }

    /// Canonical map form, as stored with the node.
    pub fn to_canonical(&self) -> Result<Map<String, Value>, serde_json::Error> {
        let value = match self {
            ProtocolParams::Vmess(p) => serde_json::to_value(p)?,
            ProtocolParams::Vless(p) => serde_json::to_value(p)?,
            ProtocolParams::Trojan(p) => serde_json::to_value(p)?,
            ProtocolParams::Shadowsocks(p) => serde_json::to_value(p)?,
            ProtocolParams::Hysteria(p) => serde_json::to_value(p)?,
            ProtocolParams::Hysteria2(p) => serde_json::to_value(p)?,
            ProtocolParams::Tuic(p) => serde_json::to_value(p)?,
            ProtocolParams::AnyTls(p) => serde_json::to_value(p)?,
        };
        match value {
            Value::Object(map) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        match self {
            ProtocolParams::Vmess(p) => p.tls.as_ref(),
            ProtocolParams::Vless(p) => p.tls.as_ref(),
            ProtocolParams::Trojan(p) => Some(&p.tls),
            ProtocolParams::Shadowsocks(_) => None,
            ProtocolParams::Hysteria(p) => Some(&p.tls),
            ProtocolParams::Hysteria2(p) => Some(&p.tls),
            ProtocolParams::Tuic(p) => Some(&p.tls),
            ProtocolParams::AnyTls(p) => Some(&p.tls),
        }
        .filter(|tls| tls.enabled)
    }

    pub fn transport(&self) -> Option<&Transport> {
        match self {
            ProtocolParams::Vmess(p) => p.transport.as_ref(),
            ProtocolParams::Vless(p) => p.transport.as_ref(),
            ProtocolParams::Trojan(p) => p.transport.as_ref(),
            _ => None,
        }
    }

    /// Replace the connection credential with a per-user secret.
    pub fn with_credential(&self, uuid: &str, password: &str) -> Self {
        let mut params = self.clone();
        match &mut params {
            ProtocolParams::Vmess(p) => p.uuid = uuid.to_string(),
            ProtocolParams::Vless(p) => p.uuid = uuid.to_string(),
            ProtocolParams::Trojan(p) => p.password = password.to_string(),
            ProtocolParams::Shadowsocks(p) => p.password = password.to_string(),
            ProtocolParams::Hysteria(p) => p.password = password.to_string(),
            ProtocolParams::Hysteria2(p) => p.password = password.to_string(),
            ProtocolParams::Tuic(p) => {
                p.uuid = uuid.to_string();
                p.password = password.to_string();
            }
            ProtocolParams::AnyTls(p) => p.password = password.to_string(),
        }
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_round_trip_keeps_defaults() {
        let params = ProtocolParams::Vless(VlessParams {
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".to_string(),
            flow: String::new(),
            encryption: "none".to_string(),
            packet_encoding: "xudp".to_string(),
            tls: None,
            transport: None,
        });
        let map = params.to_canonical().unwrap();
        assert!(!map.contains_key("flow"));
        assert!(!map.contains_key("tls"));
        assert_eq!(ProtocolParams::from_canonical("vless", &map).unwrap(), params);
    }

    #[test]
    fn test_from_canonical_rejects_unknown_protocol() {
        let map = json!({"password": "x"}).as_object().cloned().unwrap();
        let err = ProtocolParams::from_canonical("wireguard", &map).unwrap_err();
        assert_eq!(err.param, "protocol");
    }

    #[test]
    fn test_plugin_options_parsing() {
        let ss = ShadowsocksParams {
            method: "aes-128-gcm".to_string(),
            password: "pw".to_string(),
            plugin: Some("obfs-local".to_string()),
            plugin_opts: Some("obfs=http; obfs-host=cdn.example.com;broken".to_string()),
        };
        assert_eq!(ss.plugin_option("obfs").as_deref(), Some("http"));
        assert_eq!(ss.plugin_option("obfs-host").as_deref(), Some("cdn.example.com"));
        assert_eq!(ss.plugin_options().len(), 2);
    }

    #[test]
    fn test_with_credential_only_touches_secret() {
        let trojan = ProtocolParams::Trojan(TrojanParams {
            password: "node".to_string(),
            tls: TlsOptions::enabled(),
            transport: None,
        });
        match trojan.with_credential("u", "user-secret") {
            ProtocolParams::Trojan(p) => {
                assert_eq!(p.password, "user-secret");
                assert!(p.tls.enabled);
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }
}
