//! Typed parameters to engine outbounds.

use serde_json::json;

use super::model::{Outbound, OutboundTransport};
use crate::protocol::params::{Network, Transport};
use crate::protocol::ProtocolParams;

const WS_EARLY_DATA: u32 = 2048;
const WS_EARLY_DATA_HEADER: &str = "Sec-WebSocket-Protocol";

fn engine_transport(transport: &Transport) -> OutboundTransport {
    let mut out = OutboundTransport::default();
    match transport.network {
        Network::Ws => {
            out.kind = "ws".to_string();
            out.path = transport.path.clone();
            if let Some(host) = transport.first_host() {
                out.headers.insert("Host".to_string(), host.to_string());
            }
            out.max_early_data = Some(WS_EARLY_DATA);
            out.early_data_header_name = Some(WS_EARLY_DATA_HEADER.to_string());
        }
        Network::Grpc => {
            out.kind = "grpc".to_string();
            out.service_name = transport.service_name.clone();
        }
        Network::H2 | Network::Tcp => {
            // tcp only carries a transport when it uses the http header
            out.kind = "http".to_string();
            out.path = transport.path.clone();
            out.host = transport.host.clone();
        }
        Network::Quic => {
            out.kind = "quic".to_string();
        }
    }
    out
}

impl ProtocolParams {
    /// Build the engine outbound for a node reachable at `server:port`.
    pub fn to_outbound(&self, tag: &str, server: &str, port: u16) -> Outbound {
        let mut out = Outbound::new(self.protocol(), tag);
        out.server = Some(server.to_string());
        out.server_port = Some(i64::from(port));
        out.tls = self.tls().cloned();
        out.transport = self.transport().map(engine_transport);

        match self {
            ProtocolParams::Vmess(p) => {
                out.uuid = Some(p.uuid.clone());
                out.security = Some(p.security.clone());
                out.alter_id = Some(p.alter_id);
            }
            ProtocolParams::Vless(p) => {
                out.uuid = Some(p.uuid.clone());
                if !p.flow.is_empty() {
                    out.flow = Some(p.flow.clone());
                }
                out.packet_encoding = Some(p.packet_encoding.clone());
            }
            ProtocolParams::Trojan(p) => {
                out.password = Some(p.password.clone());
            }
            ProtocolParams::Shadowsocks(p) => {
                out.method = Some(p.method.clone());
                out.password = Some(p.password.clone());
                if let Some(plugin) = &p.plugin {
                    out.extra.insert("plugin".to_string(), json!(plugin));
                }
                if let Some(opts) = &p.plugin_opts {
                    out.extra.insert("plugin_opts".to_string(), json!(opts));
                }
            }
            ProtocolParams::Hysteria(p) => {
                out.extra.insert("auth_str".to_string(), json!(p.password));
                out.extra.insert("up_mbps".to_string(), json!(p.up_mbps));
                out.extra.insert("down_mbps".to_string(), json!(p.down_mbps));
                if let Some(obfs) = &p.obfs {
                    out.extra.insert("obfs".to_string(), json!(obfs));
                }
            }
            ProtocolParams::Hysteria2(p) => {
                out.password = Some(p.password.clone());
                if let Some(obfs) = &p.obfs_password {
                    out.extra.insert(
                        "obfs".to_string(),
                        json!({"type": "salamander", "password": obfs}),
                    );
                }
                if let Some(up) = p.up_mbps {
                    out.extra.insert("up_mbps".to_string(), json!(up));
                }
                if let Some(down) = p.down_mbps {
                    out.extra.insert("down_mbps".to_string(), json!(down));
                }
            }
            ProtocolParams::Tuic(p) => {
                out.uuid = Some(p.uuid.clone());
                out.password = Some(p.password.clone());
                out.extra
                    .insert("congestion_control".to_string(), json!(p.congestion_control));
                out.extra.insert("udp_relay_mode".to_string(), json!(p.udp_relay_mode));
            }
            ProtocolParams::AnyTls(p) => {
                out.password = Some(p.password.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AdapterRegistry;
    use serde_json::Value;

    fn parse(protocol: &str, raw: Value) -> ProtocolParams {
        AdapterRegistry::with_defaults()
            .parse(protocol, raw.as_object().unwrap())
            .unwrap()
    }

    #[test]
    fn test_vmess_ws_outbound() {
        let params = parse(
            "vmess",
            json!({
                "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811",
                "tls": {"server_name": "v.example.com"},
                "network": "ws",
                "network_settings": {"path": "/ray", "headers": {"Host": "v.example.com"}}
            }),
        );
        let out = params.to_outbound("hk-1", "1.2.3.4", 443);
        let value = serde_json::to_value(&out).unwrap();
        assert_eq!(value["type"], "vmess");
        assert_eq!(value["server_port"], 443);
        assert_eq!(value["security"], "auto");
        assert_eq!(value["tls"]["server_name"], "v.example.com");
        assert_eq!(value["transport"]["type"], "ws");
        assert_eq!(value["transport"]["headers"]["Host"], "v.example.com");
        assert_eq!(value["transport"]["max_early_data"], 2048);
    }

    #[test]
    fn test_hysteria2_obfs() {
        let params = parse("hysteria2", json!({"password": "pw", "obfs_password": "salt"}));
        let value = serde_json::to_value(params.to_outbound("hy2", "h.example.com", 8443)).unwrap();
        assert_eq!(value["obfs"]["type"], "salamander");
        assert_eq!(value["tls"]["enabled"], true);
    }

    #[test]
    fn test_tcp_http_header_becomes_http_transport() {
        let params = parse(
            "vmess",
            json!({
                "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811",
                "network": "tcp",
                "network_settings": {"header": {"type": "http"}}
            }),
        );
        let out = params.to_outbound("t", "1.2.3.4", 80);
        let transport = out.transport.unwrap();
        assert_eq!(transport.kind, "http");
        assert_eq!(transport.path.as_deref(), Some("/"));
    }
}
