//! Share-link bundle: one scheme URI per line, base64 encoded as a whole.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::json;

use super::{authority, ProxyDescriptor};
use crate::protocol::params::{Network, TlsOptions, Transport};
use crate::protocol::{is_ss2022, ProtocolParams};

/// Query string builder that percent-encodes values.
#[derive(Default)]
struct Query(Vec<String>);

impl Query {
    fn push(&mut self, key: &str, value: impl AsRef<str>) -> &mut Self {
        self.0
            .push(format!("{}={}", key, urlencoding::encode(value.as_ref())));
        self
    }

    fn push_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.push(key, value);
        }
        self
    }

    fn finish(&self) -> String {
        if self.0.is_empty() {
            String::new()
        } else {
            format!("?{}", self.0.join("&"))
        }
    }
}

fn fragment(name: &str) -> String {
    format!("#{}", urlencoding::encode(name))
}

/// Security, SNI and transport parameters shared by the v2ray-style links.
fn stream_query(query: &mut Query, tls: Option<&TlsOptions>, transport: Option<&Transport>) {
    let network = transport.map(|t| t.network).unwrap_or(Network::Tcp);
    query.push("type", match network {
        Network::H2 => "http",
        other => other.as_str(),
    });

    match tls {
        Some(tls) => {
            query.push("security", if tls.reality().is_some() { "reality" } else { "tls" });
            query.push_opt("sni", tls.server_name.as_deref());
            if let Some(utls) = tls.utls.as_ref().filter(|u| u.enabled) {
                query.push("fp", &utls.fingerprint);
            }
            if !tls.alpn.is_empty() {
                query.push("alpn", tls.alpn.join(","));
            }
            if let Some(reality) = tls.reality() {
                query.push("pbk", &reality.public_key);
                if !reality.short_id.is_empty() {
                    query.push("sid", &reality.short_id);
                }
            }
            if tls.insecure {
                query.push("allowInsecure", "1");
            }
        }
        None => {
            query.push("security", "none");
        }
    }

    if let Some(t) = transport {
        match t.network {
            Network::Ws | Network::H2 => {
                query.push_opt("path", t.path.as_deref());
                query.push_opt("host", t.first_host());
            }
            Network::Grpc => {
                query.push_opt("serviceName", t.service_name.as_deref());
            }
            Network::Tcp => {
                query.push_opt("headerType", t.header_type.as_deref());
                query.push_opt("path", t.path.as_deref());
                query.push_opt("host", t.first_host());
            }
            Network::Quic => {
                query.push_opt("quicSecurity", t.security.as_deref());
            }
        }
    }
}

fn vmess_link(proxy: &ProxyDescriptor, p: &crate::protocol::params::VmessParams) -> String {
    let tls = proxy.params.tls();
    let transport = p.transport.as_ref();
    let network = transport.map(|t| t.network).unwrap_or(Network::Tcp);
    let path = match network {
        Network::Grpc => transport.and_then(|t| t.service_name.clone()),
        _ => transport.and_then(|t| t.path.clone()),
    };
    let body = json!({
        "v": "2",
        "ps": proxy.name,
        "add": proxy.server,
        "port": proxy.port.to_string(),
        "id": p.uuid,
        "aid": p.alter_id.to_string(),
        "scy": p.security,
        "net": match network { Network::H2 => "h2", other => other.as_str() },
        "type": transport.and_then(|t| t.header_type.clone()).unwrap_or_else(|| "none".to_string()),
        "host": transport.and_then(|t| t.first_host()).unwrap_or_default(),
        "path": path.unwrap_or_default(),
        "tls": if tls.is_some() { "tls" } else { "" },
        "sni": tls.and_then(|t| t.server_name.clone()).unwrap_or_default(),
        "alpn": tls.map(|t| t.alpn.join(",")).unwrap_or_default(),
        "fp": tls.and_then(|t| t.utls.as_ref()).map(|u| u.fingerprint.clone()).unwrap_or_default(),
    });
    format!("vmess://{}", STANDARD.encode(body.to_string()))
}

fn link(proxy: &ProxyDescriptor) -> String {
    let addr = authority(&proxy.server, proxy.port);
    let name = fragment(&proxy.name);
    match &proxy.params {
        ProtocolParams::Shadowsocks(p) => {
            let userinfo = if is_ss2022(&p.method) {
                format!(
                    "{}:{}",
                    urlencoding::encode(&p.method),
                    urlencoding::encode(&p.password)
                )
            } else {
                URL_SAFE_NO_PAD.encode(format!("{}:{}", p.method, p.password))
            };
            let mut query = Query::default();
            if let Some(plugin) = p.plugin.as_deref() {
                let value = match p.plugin_opts.as_deref() {
                    Some(opts) => format!("{};{}", plugin, opts),
                    None => plugin.to_string(),
                };
                query.push("plugin", value);
            }
            let slash = if query.0.is_empty() { "" } else { "/" };
            format!("ss://{}@{}{}{}{}", userinfo, addr, slash, query.finish(), name)
        }
        ProtocolParams::Vmess(p) => vmess_link(proxy, p),
        ProtocolParams::Vless(p) => {
            let mut query = Query::default();
            query.push("encryption", &p.encryption);
            stream_query(&mut query, proxy.params.tls(), p.transport.as_ref());
            if !p.flow.is_empty() {
                query.push("flow", &p.flow);
            }
            format!("vless://{}@{}{}{}", p.uuid, addr, query.finish(), name)
        }
        ProtocolParams::Trojan(p) => {
            let mut query = Query::default();
            stream_query(&mut query, Some(&p.tls), p.transport.as_ref());
            format!(
                "trojan://{}@{}{}{}",
                urlencoding::encode(&p.password),
                addr,
                query.finish(),
                name
            )
        }
        ProtocolParams::Hysteria(p) => {
            let mut query = Query::default();
            query
                .push("protocol", "udp")
                .push("auth", &p.password)
                .push_opt("peer", p.tls.server_name.as_deref())
                .push("upmbps", p.up_mbps.to_string())
                .push("downmbps", p.down_mbps.to_string())
                .push_opt("obfsParam", p.obfs.as_deref());
            if !p.tls.alpn.is_empty() {
                query.push("alpn", p.tls.alpn.join(","));
            }
            if p.tls.insecure {
                query.push("insecure", "1");
            }
            format!("hysteria://{}{}{}", addr, query.finish(), name)
        }
        ProtocolParams::Hysteria2(p) => {
            let mut query = Query::default();
            query.push_opt("sni", p.tls.server_name.as_deref());
            if let Some(obfs) = p.obfs_password.as_deref() {
                query.push("obfs", "salamander").push("obfs-password", obfs);
            }
            if p.tls.insecure {
                query.push("insecure", "1");
            }
            format!(
                "hysteria2://{}@{}{}{}",
                urlencoding::encode(&p.password),
                addr,
                query.finish(),
                name
            )
        }
        ProtocolParams::Tuic(p) => {
            let mut query = Query::default();
            query
                .push_opt("sni", p.tls.server_name.as_deref())
                .push("congestion_control", &p.congestion_control)
                .push("udp_relay_mode", &p.udp_relay_mode);
            if !p.tls.alpn.is_empty() {
                query.push("alpn", p.tls.alpn.join(","));
            }
            if p.tls.insecure {
                query.push("allow_insecure", "1");
            }
            format!(
                "tuic://{}:{}@{}{}{}",
                p.uuid,
                urlencoding::encode(&p.password),
                addr,
                query.finish(),
                name
            )
        }
        ProtocolParams::AnyTls(p) => {
            let mut query = Query::default();
            query.push_opt("sni", p.tls.server_name.as_deref());
            if p.tls.insecure {
                query.push("insecure", "1");
            }
            format!(
                "anytls://{}@{}{}{}",
                urlencoding::encode(&p.password),
                addr,
                query.finish(),
                name
            )
        }
    }
}

/// Plain share links, one per line.
pub fn links(proxies: &[ProxyDescriptor]) -> Vec<String> {
    proxies.iter().map(link).collect()
}

pub fn render(proxies: &[ProxyDescriptor]) -> String {
    STANDARD.encode(links(proxies).join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribe::fixtures::{proxies, UUID};
    use serde_json::Value;

    #[test]
    fn test_bundle_decodes_to_links() {
        let body = render(&proxies());
        let decoded = String::from_utf8(STANDARD.decode(body).unwrap()).unwrap();
        let schemes: Vec<&str> = decoded
            .lines()
            .map(|l| l.split("://").next().unwrap())
            .collect();
        assert_eq!(
            schemes,
            vec!["vmess", "vless", "trojan", "ss", "ss", "hysteria2", "tuic", "anytls"]
        );
    }

    #[test]
    fn test_vmess_link_body() {
        let all = links(&proxies());
        let encoded = all[0].strip_prefix("vmess://").unwrap();
        let body: Value = serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(body["id"], UUID);
        assert_eq!(body["net"], "ws");
        assert_eq!(body["path"], "/ray");
        assert_eq!(body["host"], "cdn.example.com");
        assert_eq!(body["tls"], "tls");
        assert_eq!(body["port"], "443");
    }

    #[test]
    fn test_vless_reality_link() {
        let all = links(&proxies());
        assert_eq!(
            all[1],
            format!(
                "vless://{}@jp.example.com:443?encryption=none&type=tcp&security=reality&sni=www.example.com&pbk=pubkey&sid=ab12&flow=xtls-rprx-vision#jp-vless",
                UUID
            )
        );
    }

    #[test]
    fn test_shadowsocks_userinfo() {
        let all = links(&proxies());
        let legacy = URL_SAFE_NO_PAD.encode(format!("aes-256-gcm:{}", UUID));
        assert_eq!(all[3], format!("ss://{}@sg.example.com:8388#sg-ss", legacy));
        // AEAD-2022 keys go percent-encoded, not base64-wrapped
        assert!(all[4].starts_with("ss://2022-blake3-aes-128-gcm:"));
        assert!(all[4].contains("%3A"));
    }
}
