//! Clash and Clash-Meta YAML profiles.

use serde_yaml::{Mapping, Number, Value};

use super::ProxyDescriptor;
use crate::protocol::params::{Network, TlsOptions, Transport};
use crate::protocol::{is_ss2022, ProtocolParams};

const SELECT_GROUP: &str = "Proxy";
const AUTO_GROUP: &str = "Auto";
const TEST_URL: &str = "http://www.gstatic.com/generate_204";

/// Ordered YAML mapping with string keys.
#[derive(Default)]
struct Entry(Mapping);

impl Entry {
    fn set(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.0.insert(Value::from(key), value.into());
        self
    }

    fn set_num(&mut self, key: &str, value: u64) -> &mut Self {
        self.0
            .insert(Value::from(key), Value::Number(Number::from(value)));
        self
    }

    fn set_opt(&mut self, key: &str, value: Option<&str>) -> &mut Self {
        if let Some(value) = value {
            self.set(key, value);
        }
        self
    }

    fn set_list(&mut self, key: &str, values: &[String]) -> &mut Self {
        let list: Vec<Value> = values.iter().map(|v| Value::from(v.as_str())).collect();
        self.0.insert(Value::from(key), Value::Sequence(list));
        self
    }

    fn into_value(self) -> Value {
        Value::Mapping(self.0)
    }
}

fn base(proxy: &ProxyDescriptor, kind: &str) -> Entry {
    let mut entry = Entry::default();
    entry
        .set("name", proxy.name.as_str())
        .set("type", kind)
        .set("server", proxy.server.as_str())
        .set_num("port", u64::from(proxy.port));
    entry
}

fn apply_tls(entry: &mut Entry, tls: Option<&TlsOptions>, sni_key: &str, meta: bool) {
    let Some(tls) = tls else {
        return;
    };
    entry.set_opt(sni_key, tls.server_name.as_deref());
    if tls.insecure {
        entry.set("skip-cert-verify", true);
    }
    if !tls.alpn.is_empty() {
        entry.set_list("alpn", &tls.alpn);
    }
    if meta {
        if let Some(utls) = tls.utls.as_ref().filter(|u| u.enabled) {
            entry.set("client-fingerprint", utls.fingerprint.as_str());
        }
    }
}

fn apply_transport(entry: &mut Entry, transport: Option<&Transport>) {
    let Some(transport) = transport else {
        return;
    };
    match transport.network {
        Network::Ws => {
            let mut opts = Entry::default();
            opts.set("path", transport.path.as_deref().unwrap_or("/"));
            if let Some(host) = transport.first_host() {
                let mut headers = Entry::default();
                headers.set("Host", host);
                opts.set("headers", headers.into_value());
            }
            entry.set("network", "ws").set("ws-opts", opts.into_value());
        }
        Network::Grpc => {
            let mut opts = Entry::default();
            opts.set_opt("grpc-service-name", transport.service_name.as_deref());
            entry.set("network", "grpc").set("grpc-opts", opts.into_value());
        }
        Network::H2 => {
            let mut opts = Entry::default();
            opts.set_list("host", &transport.host)
                .set("path", transport.path.as_deref().unwrap_or("/"));
            entry.set("network", "h2").set("h2-opts", opts.into_value());
        }
        Network::Tcp => {
            let mut opts = Entry::default();
            opts.set("path", Value::Sequence(vec![Value::from(
                transport.path.as_deref().unwrap_or("/"),
            )]));
            if !transport.host.is_empty() {
                let mut headers = Entry::default();
                headers.set_list("Host", &transport.host);
                opts.set("headers", headers.into_value());
            }
            entry.set("network", "http").set("http-opts", opts.into_value());
        }
        Network::Quic => {}
    }
}

/// One proxy entry, or `None` when the target cannot express it.
fn proxy_entry(proxy: &ProxyDescriptor, meta: bool) -> Option<Value> {
    let entry = match &proxy.params {
        ProtocolParams::Shadowsocks(p) => {
            if is_ss2022(&p.method) && !meta {
                return None;
            }
            let mut e = base(proxy, "ss");
            e.set("cipher", p.method.as_str())
                .set("password", p.password.as_str())
                .set("udp", true);
            if let Some(plugin) = p.plugin.as_deref() {
                let (name, mode_key) = match plugin {
                    "obfs-local" | "simple-obfs" | "obfs" => ("obfs", "obfs"),
                    "v2ray-plugin" => ("v2ray-plugin", "mode"),
                    _ => return None,
                };
                let mut opts = Entry::default();
                opts.set_opt("mode", p.plugin_option(mode_key).as_deref())
                    .set_opt("host", p.plugin_option("obfs-host").or_else(|| p.plugin_option("host")).as_deref());
                e.set("plugin", name).set("plugin-opts", opts.into_value());
            }
            e
        }
        ProtocolParams::Vmess(p) => {
            if p.transport.as_ref().is_some_and(|t| t.network == Network::Quic) {
                return None;
            }
            let mut e = base(proxy, "vmess");
            e.set("uuid", p.uuid.as_str())
                .set_num("alterId", u64::from(p.alter_id))
                .set("cipher", p.security.as_str())
                .set("udp", true);
            let tls = proxy.params.tls();
            if tls.is_some() {
                e.set("tls", true);
            }
            apply_tls(&mut e, tls, "servername", meta);
            apply_transport(&mut e, p.transport.as_ref());
            e
        }
        ProtocolParams::Trojan(p) => {
            let network = p.transport.as_ref().map(|t| t.network);
            if !matches!(network, None | Some(Network::Ws) | Some(Network::Grpc)) {
                return None;
            }
            let mut e = base(proxy, "trojan");
            e.set("password", p.password.as_str()).set("udp", true);
            apply_tls(&mut e, Some(&p.tls), "sni", meta);
            apply_transport(&mut e, p.transport.as_ref());
            e
        }
        ProtocolParams::Vless(p) if meta => {
            let mut e = base(proxy, "vless");
            e.set("uuid", p.uuid.as_str()).set("udp", true);
            if !p.flow.is_empty() {
                e.set("flow", p.flow.as_str());
            }
            e.set("packet-encoding", p.packet_encoding.as_str());
            let tls = proxy.params.tls();
            if tls.is_some() {
                e.set("tls", true);
            }
            apply_tls(&mut e, tls, "servername", meta);
            if let Some(reality) = tls.and_then(|t| t.reality()) {
                let mut opts = Entry::default();
                opts.set("public-key", reality.public_key.as_str());
                if !reality.short_id.is_empty() {
                    opts.set("short-id", reality.short_id.as_str());
                }
                e.set("reality-opts", opts.into_value());
            }
            apply_transport(&mut e, p.transport.as_ref());
            e
        }
        ProtocolParams::Hysteria(p) if meta => {
            let mut e = base(proxy, "hysteria");
            e.set("auth-str", p.password.as_str())
                .set("up", format!("{} Mbps", p.up_mbps))
                .set("down", format!("{} Mbps", p.down_mbps))
                .set_opt("obfs", p.obfs.as_deref());
            apply_tls(&mut e, Some(&p.tls), "sni", meta);
            e
        }
        ProtocolParams::Hysteria2(p) if meta => {
            let mut e = base(proxy, "hysteria2");
            e.set("password", p.password.as_str());
            if let Some(obfs) = p.obfs_password.as_deref() {
                e.set("obfs", "salamander").set("obfs-password", obfs);
            }
            if let Some(up) = p.up_mbps {
                e.set("up", format!("{} Mbps", up));
            }
            if let Some(down) = p.down_mbps {
                e.set("down", format!("{} Mbps", down));
            }
            apply_tls(&mut e, Some(&p.tls), "sni", meta);
            e
        }
        ProtocolParams::Tuic(p) if meta => {
            let mut e = base(proxy, "tuic");
            e.set("uuid", p.uuid.as_str())
                .set("password", p.password.as_str())
                .set("congestion-controller", p.congestion_control.as_str())
                .set("udp-relay-mode", p.udp_relay_mode.as_str());
            apply_tls(&mut e, Some(&p.tls), "sni", meta);
            e
        }
        ProtocolParams::AnyTls(p) if meta => {
            let mut e = base(proxy, "anytls");
            e.set("password", p.password.as_str()).set("udp", true);
            apply_tls(&mut e, Some(&p.tls), "sni", meta);
            e
        }
        _ => return None,
    };
    Some(entry.into_value())
}

fn group(name: &str, kind: &str, members: Vec<Value>) -> Value {
    let mut g = Entry::default();
    g.set("name", name).set("type", kind);
    g.0.insert(Value::from("proxies"), Value::Sequence(members));
    if kind == "url-test" {
        g.set("url", TEST_URL).set_num("interval", 300).set_num("tolerance", 50);
    }
    g.into_value()
}

/// Render a Clash profile. `meta` enables the Clash-Meta protocol set.
pub fn render(proxies: &[ProxyDescriptor], meta: bool) -> Result<String, serde_yaml::Error> {
    let mut entries = Vec::new();
    let mut names = Vec::new();
    for proxy in proxies {
        if let Some(entry) = proxy_entry(proxy, meta) {
            entries.push(entry);
            names.push(Value::from(proxy.name.as_str()));
        }
    }

    let mut select = vec![Value::from(AUTO_GROUP)];
    select.extend(names.iter().cloned());
    select.push(Value::from("DIRECT"));

    let rules: Vec<Value> = [
        "GEOSITE,category-ads-all,REJECT",
        "GEOIP,LAN,DIRECT,no-resolve",
        "GEOIP,CN,DIRECT",
    ]
    .iter()
    .map(|r| Value::from(*r))
    .chain(std::iter::once(Value::from(format!("MATCH,{}", SELECT_GROUP))))
    .collect();

    let mut doc = Entry::default();
    doc.set_num("mixed-port", 7890)
        .set("allow-lan", false)
        .set("mode", "rule")
        .set("log-level", "info");
    doc.0.insert(Value::from("proxies"), Value::Sequence(entries));
    doc.0.insert(
        Value::from("proxy-groups"),
        Value::Sequence(vec![
            group(SELECT_GROUP, "select", select),
            group(AUTO_GROUP, "url-test", names),
        ]),
    );
    doc.0.insert(Value::from("rules"), Value::Sequence(rules));

    serde_yaml::to_string(&doc.into_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribe::fixtures::{proxies, UUID};

    fn proxy_names(yaml: &str) -> Vec<String> {
        let doc: Value = serde_yaml::from_str(yaml).unwrap();
        doc["proxies"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|p| p["name"].as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_classic_clash_omits_meta_only_protocols() {
        let yaml = render(&proxies(), false).unwrap();
        assert_eq!(proxy_names(&yaml), vec!["hk-vmess", "us-trojan", "sg-ss"]);
    }

    #[test]
    fn test_meta_includes_vless_reality_and_anytls() {
        let yaml = render(&proxies(), true).unwrap();
        let names = proxy_names(&yaml);
        assert!(names.contains(&"jp-vless".to_string()));
        assert!(names.contains(&"uk-anytls".to_string()));
        assert!(names.contains(&"de-ss2022".to_string()));

        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let vless = doc["proxies"]
            .as_sequence()
            .unwrap()
            .iter()
            .find(|p| p["name"].as_str() == Some("jp-vless"))
            .unwrap();
        assert_eq!(vless["uuid"].as_str(), Some(UUID));
        assert_eq!(vless["reality-opts"]["public-key"].as_str(), Some("pubkey"));
        assert_eq!(vless["flow"].as_str(), Some("xtls-rprx-vision"));
    }

    #[test]
    fn test_vmess_ws_options() {
        let yaml = render(&proxies(), false).unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let vmess = &doc["proxies"][0];
        assert_eq!(vmess["network"].as_str(), Some("ws"));
        assert_eq!(vmess["ws-opts"]["path"].as_str(), Some("/ray"));
        assert_eq!(vmess["ws-opts"]["headers"]["Host"].as_str(), Some("cdn.example.com"));
        assert_eq!(vmess["servername"].as_str(), Some("hk.example.com"));
        assert_eq!(vmess["port"].as_u64(), Some(443));
    }

    #[test]
    fn test_groups_reference_rendered_proxies() {
        let yaml = render(&proxies(), false).unwrap();
        let doc: Value = serde_yaml::from_str(&yaml).unwrap();
        let select = doc["proxy-groups"][0]["proxies"].as_sequence().unwrap();
        assert_eq!(select.first().and_then(Value::as_str), Some("Auto"));
        assert_eq!(select.last().and_then(Value::as_str), Some("DIRECT"));
        assert_eq!(select.len(), 5);
    }
}
