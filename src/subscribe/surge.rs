//! Surge and Surfboard profiles.

use std::fmt::Write;

use super::ProxyDescriptor;
use crate::protocol::params::{Network, TlsOptions};
use crate::protocol::{is_ss2022, ProtocolParams};

const TEST_URL: &str = "http://www.gstatic.com/generate_204";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Surge,
    Surfboard,
}

fn tls_fields(fields: &mut Vec<String>, tls: &TlsOptions) {
    if let Some(sni) = tls.server_name.as_deref() {
        fields.push(format!("sni={}", sni));
    }
    if tls.insecure {
        fields.push("skip-cert-verify=true".to_string());
    }
}

fn proxy_line(proxy: &ProxyDescriptor, flavor: Flavor) -> Option<String> {
    let mut fields = Vec::new();
    let kind = match &proxy.params {
        ProtocolParams::Shadowsocks(p) => {
            if flavor == Flavor::Surfboard && is_ss2022(&p.method) {
                return None;
            }
            fields.push(format!("encrypt-method={}", p.method));
            fields.push(format!("password={}", p.password));
            if let Some(obfs) = p.plugin_option("obfs") {
                fields.push(format!("obfs={}", obfs));
                if let Some(host) = p.plugin_option("obfs-host") {
                    fields.push(format!("obfs-host={}", host));
                }
            } else if p.plugin.is_some() {
                return None;
            }
            fields.push("udp-relay=true".to_string());
            "ss"
        }
        ProtocolParams::Vmess(p) => {
            fields.push(format!("username={}", p.uuid));
            if let Some(tls) = proxy.params.tls() {
                fields.push("tls=true".to_string());
                tls_fields(&mut fields, tls);
            }
            match p.transport.as_ref().map(|t| (t.network, t)) {
                None => {}
                Some((Network::Ws, t)) => {
                    fields.push("ws=true".to_string());
                    fields.push(format!("ws-path={}", t.path.as_deref().unwrap_or("/")));
                    if let Some(host) = t.first_host() {
                        fields.push(format!("ws-headers=Host:{}", host));
                    }
                }
                Some(_) => return None,
            }
            if p.alter_id == 0 {
                fields.push("vmess-aead=true".to_string());
            }
            "vmess"
        }
        ProtocolParams::Trojan(p) => {
            fields.push(format!("password={}", p.password));
            tls_fields(&mut fields, &p.tls);
            match p.transport.as_ref().map(|t| (t.network, t)) {
                None => {}
                Some((Network::Ws, t)) => {
                    fields.push("ws=true".to_string());
                    fields.push(format!("ws-path={}", t.path.as_deref().unwrap_or("/")));
                    if let Some(host) = t.first_host() {
                        fields.push(format!("ws-headers=Host:{}", host));
                    }
                }
                Some(_) => return None,
            }
            "trojan"
        }
        ProtocolParams::Hysteria2(p) if flavor == Flavor::Surge => {
            fields.push(format!("password={}", p.password));
            tls_fields(&mut fields, &p.tls);
            if let Some(down) = p.down_mbps {
                fields.push(format!("download-bandwidth={}", down));
            }
            if p.obfs_password.is_some() {
                return None;
            }
            "hysteria2"
        }
        ProtocolParams::Tuic(p) if flavor == Flavor::Surge => {
            fields.push(format!("uuid={}", p.uuid));
            fields.push(format!("password={}", p.password));
            tls_fields(&mut fields, &p.tls);
            if !p.tls.alpn.is_empty() {
                fields.push(format!("alpn={}", p.tls.alpn.join(",")));
            }
            "tuic-v5"
        }
        _ => return None,
    };

    let mut line = format!("{} = {}, {}, {}", proxy.name, kind, proxy.server, proxy.port);
    for field in fields {
        line.push_str(", ");
        line.push_str(&field);
    }
    Some(line)
}

pub fn render(proxies: &[ProxyDescriptor], flavor: Flavor) -> String {
    let mut lines = Vec::new();
    let mut names = Vec::new();
    for proxy in proxies {
        if let Some(line) = proxy_line(proxy, flavor) {
            lines.push(line);
            names.push(proxy.name.as_str());
        }
    }

    let mut out = String::new();
    let _ = writeln!(out, "[General]");
    let _ = writeln!(out, "loglevel = notify");
    let _ = writeln!(out, "dns-server = system, 223.5.5.5, 1.1.1.1");
    let _ = writeln!(out, "skip-proxy = 127.0.0.1, 192.168.0.0/16, 10.0.0.0/8, localhost, *.local");
    let _ = writeln!(out);
    let _ = writeln!(out, "[Proxy]");
    let _ = writeln!(out, "DIRECT = direct");
    for line in &lines {
        let _ = writeln!(out, "{}", line);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Proxy Group]");
    let mut select = vec!["Auto"];
    select.extend(names.iter().copied());
    select.push("DIRECT");
    let _ = writeln!(out, "Proxy = select, {}", select.join(", "));
    if !names.is_empty() {
        let _ = writeln!(
            out,
            "Auto = url-test, {}, url={}, interval=300, tolerance=50",
            names.join(", "),
            TEST_URL
        );
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "[Rule]");
    let _ = writeln!(out, "GEOIP,CN,DIRECT");
    let _ = writeln!(out, "FINAL,Proxy,dns-failed");
    out
}
