//! Quantumult X and Loon server lists.

use super::{authority, ProxyDescriptor};
use crate::protocol::params::{Network, TlsOptions, Transport};
use crate::protocol::ProtocolParams;

fn join_lines(lines: impl Iterator<Item = String>) -> String {
    let mut out: String = lines.collect::<Vec<_>>().join("\n");
    out.push('\n');
    out
}

/// `obfs` fields for Quantumult X stream transports.
fn qx_obfs(fields: &mut Vec<String>, tls: Option<&TlsOptions>, transport: Option<&Transport>) -> Option<()> {
    match transport.map(|t| t.network) {
        None | Some(Network::Tcp) => {
            if let Some(tls) = tls {
                fields.push("obfs=over-tls".to_string());
                if let Some(sni) = tls.server_name.as_deref() {
                    fields.push(format!("obfs-host={}", sni));
                }
            }
        }
        Some(Network::Ws) => {
            let t = transport?;
            fields.push(format!("obfs={}", if tls.is_some() { "wss" } else { "ws" }));
            let host = t
                .first_host()
                .or_else(|| tls.and_then(|t| t.server_name.as_deref()));
            if let Some(host) = host {
                fields.push(format!("obfs-host={}", host));
            }
            fields.push(format!("obfs-uri={}", t.path.as_deref().unwrap_or("/")));
        }
        Some(_) => return None,
    }
    if let Some(tls) = tls {
        fields.push(format!("tls-verification={}", !tls.insecure));
    }
    Some(())
}

fn quantumult_x_line(proxy: &ProxyDescriptor) -> Option<String> {
    let mut fields = Vec::new();
    let kind = match &proxy.params {
        ProtocolParams::Shadowsocks(p) => {
            fields.push(format!("method={}", p.method));
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
            "shadowsocks"
        }
        ProtocolParams::Vmess(p) => {
            fields.push("method=chacha20-poly1305".to_string());
            fields.push(format!("password={}", p.uuid));
            qx_obfs(&mut fields, proxy.params.tls(), p.transport.as_ref())?;
            if p.alter_id == 0 {
                fields.push("aead=true".to_string());
            }
            "vmess"
        }
        ProtocolParams::Vless(p) => {
            let tls = proxy.params.tls();
            if !p.flow.is_empty() || tls.and_then(|t| t.reality()).is_some() {
                return None;
            }
            fields.push("method=none".to_string());
            fields.push(format!("password={}", p.uuid));
            qx_obfs(&mut fields, tls, p.transport.as_ref())?;
            "vless"
        }
        ProtocolParams::Trojan(p) => {
            fields.push(format!("password={}", p.password));
            match p.transport.as_ref() {
                None => {
                    fields.push("over-tls=true".to_string());
                    if let Some(sni) = p.tls.server_name.as_deref() {
                        fields.push(format!("tls-host={}", sni));
                    }
                    fields.push(format!("tls-verification={}", !p.tls.insecure));
                }
                Some(t) => qx_obfs(&mut fields, Some(&p.tls), Some(t))?,
            }
            "trojan"
        }
        _ => return None,
    };

    fields.push("fast-open=false".to_string());
    fields.push(format!("tag={}", proxy.name));
    Some(format!(
        "{}={}, {}",
        kind,
        authority(&proxy.server, proxy.port),
        fields.join(", ")
    ))
}

pub fn render_quantumult_x(proxies: &[ProxyDescriptor]) -> String {
    join_lines(proxies.iter().filter_map(quantumult_x_line))
}

fn loon_tls(fields: &mut Vec<String>, tls: &TlsOptions) {
    if let Some(sni) = tls.server_name.as_deref() {
        fields.push(format!("tls-name={}", sni));
    }
    fields.push(format!("skip-cert-verify={}", tls.insecure));
}

fn loon_transport(fields: &mut Vec<String>, transport: Option<&Transport>) -> Option<()> {
    match transport {
        None => fields.push("transport=tcp".to_string()),
        Some(t) => match t.network {
            Network::Tcp => fields.push("transport=tcp".to_string()),
            Network::Ws => {
                fields.push("transport=ws".to_string());
                fields.push(format!("path={}", t.path.as_deref().unwrap_or("/")));
                if let Some(host) = t.first_host() {
                    fields.push(format!("host={}", host));
                }
            }
            Network::H2 => {
                fields.push("transport=http".to_string());
                fields.push(format!("path={}", t.path.as_deref().unwrap_or("/")));
                if let Some(host) = t.first_host() {
                    fields.push(format!("host={}", host));
                }
            }
            _ => return None,
        },
    }
    Some(())
}

fn loon_line(proxy: &ProxyDescriptor) -> Option<String> {
    let head = |kind: &str| format!("{} = {},{},{}", proxy.name, kind, proxy.server, proxy.port);
    let line = match &proxy.params {
        ProtocolParams::Shadowsocks(p) => {
            if p.plugin.is_some() {
                return None;
            }
            format!("{},{},\"{}\",udp=true", head("Shadowsocks"), p.method, p.password)
        }
        ProtocolParams::Vmess(p) => {
            let mut fields = vec![p.security.clone(), format!("\"{}\"", p.uuid)];
            loon_transport(&mut fields, p.transport.as_ref())?;
            if let Some(tls) = proxy.params.tls() {
                fields.push("over-tls=true".to_string());
                loon_tls(&mut fields, tls);
            }
            fields.push(format!("alterId={}", p.alter_id));
            format!("{},{}", head("vmess"), fields.join(","))
        }
        ProtocolParams::Vless(p) => {
            let mut fields = vec![format!("\"{}\"", p.uuid)];
            loon_transport(&mut fields, p.transport.as_ref())?;
            if let Some(tls) = proxy.params.tls() {
                fields.push("over-tls=true".to_string());
                loon_tls(&mut fields, tls);
                if let Some(reality) = tls.reality() {
                    fields.push(format!("public-key=\"{}\"", reality.public_key));
                    if !reality.short_id.is_empty() {
                        fields.push(format!("short-id={}", reality.short_id));
                    }
                }
            }
            if !p.flow.is_empty() {
                fields.push(format!("flow={}", p.flow));
            }
            format!("{},{}", head("VLESS"), fields.join(","))
        }
        ProtocolParams::Trojan(p) => {
            let mut fields = vec![format!("\"{}\"", p.password)];
            if let Some(t) = p.transport.as_ref() {
                loon_transport(&mut fields, Some(t))?;
            }
            loon_tls(&mut fields, &p.tls);
            format!("{},{}", head("trojan"), fields.join(","))
        }
        ProtocolParams::Hysteria2(p) => {
            let mut fields = vec![format!("\"{}\"", p.password)];
            loon_tls(&mut fields, &p.tls);
            if let Some(obfs) = p.obfs_password.as_deref() {
                fields.push("salamander-password=".to_string() + obfs);
            }
            if let Some(down) = p.down_mbps {
                fields.push(format!("download-bandwidth={}", down));
            }
            fields.push("udp=true".to_string());
            format!("{},{}", head("Hysteria2"), fields.join(","))
        }
        _ => return None,
    };
    Some(line)
}

pub fn render_loon(proxies: &[ProxyDescriptor]) -> String {
    join_lines(proxies.iter().filter_map(loon_line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscribe::fixtures::{proxies, UUID};

    #[test]
    fn test_quantumult_x_lines() {
        let out = render_quantumult_x(&proxies());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(
            lines[0],
            format!(
                "vmess=hk.example.com:443, method=chacha20-poly1305, password={}, obfs=wss, obfs-host=cdn.example.com, obfs-uri=/ray, tls-verification=true, aead=true, fast-open=false, tag=hk-vmess",
                UUID
            )
        );
        assert!(lines.iter().any(|l| l.starts_with("trojan=us.example.com:8443") && l.contains("over-tls=true")));
        assert!(lines.iter().any(|l| l.starts_with("shadowsocks=sg.example.com:8388")));
        // reality vless and QUIC protocols are not expressible
        assert!(!out.contains("jp-vless"));
        assert!(!out.contains("tw-tuic"));
    }

    #[test]
    fn test_loon_lines() {
        let out = render_loon(&proxies());
        assert!(out.contains(&format!(
            "hk-vmess = vmess,hk.example.com,443,auto,\"{}\",transport=ws,path=/ray,host=cdn.example.com,over-tls=true,tls-name=hk.example.com,skip-cert-verify=false,alterId=0",
            UUID
        )));
        assert!(out.contains("jp-vless = VLESS,jp.example.com,443"));
        assert!(out.contains("public-key=\"pubkey\""));
        assert!(out.contains("kr-hy2 = Hysteria2,kr.example.com,8443"));
        assert!(!out.contains("uk-anytls"));
    }
}
