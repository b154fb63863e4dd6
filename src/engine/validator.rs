//! Structural validation of engine configurations.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::model::{EngineConfig, Inbound, Outbound};
use crate::protocol::{is_uuid, SHADOWSOCKS_METHODS, VLESS_FLOWS, VMESS_SECURITIES};

pub const OUTBOUND_TYPES: &[&str] = &[
    "direct", "block", "dns", "selector", "urltest", "vmess", "vless", "trojan", "shadowsocks",
    "hysteria", "hysteria2", "tuic", "anytls", "socks", "http",
];

pub const PROXY_TYPES: &[&str] = &[
    "vmess", "vless", "trojan", "shadowsocks", "hysteria", "hysteria2", "tuic", "anytls", "socks",
    "http",
];

pub const INBOUND_TYPES: &[&str] = &["mixed", "socks", "http", "tun", "redirect", "tproxy"];

fn domain_regex() -> &'static Regex {
    static DOMAIN: OnceLock<Regex> = OnceLock::new();
    DOMAIN.get_or_init(|| {
        Regex::new(r"^(?:[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?\.)+[a-zA-Z]{2,63}$")
            .expect("domain pattern compiles")
    })
}

/// Hostname or IP literal accepted as an outbound server.
pub fn is_valid_host(host: &str) -> bool {
    host == "localhost" || host.parse::<IpAddr>().is_ok() || domain_regex().is_match(host)
}

/// A single failed rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{field}: {message}")]
pub struct ConfigValidationError {
    pub field: String,
    pub value: String,
    pub rule: String,
    pub message: String,
}

impl ConfigValidationError {
    fn new(field: impl Into<String>, value: impl Into<String>, rule: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            rule: rule.to_string(),
            message: message.into(),
        }
    }
}

/// Outcome of validating one document. Only `errors` block acceptance.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
    pub suggestions: Vec<String>,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, value: impl Into<String>, rule: &str, message: impl Into<String>) {
        self.errors.push(ConfigValidationError::new(field, value, rule, message));
    }

    fn warning(&mut self, field: impl Into<String>, value: impl Into<String>, rule: &str, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError::new(field, value, rule, message));
    }

    pub fn error_summary(&self) -> String {
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a raw JSON document.
    pub fn validate_json(&self, document: &Value) -> ValidationResult {
        match serde_json::from_value::<EngineConfig>(document.clone()) {
            Ok(config) => self.validate(&config),
            Err(e) => {
                let mut result = ValidationResult::default();
                result.error("$", "", "json", format!("document is not a valid config: {}", e));
                result
            }
        }
    }

    pub fn validate(&self, config: &EngineConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        if let Err(e) = serde_json::to_string(config) {
            result.error("$", "", "json", format!("config cannot be serialized: {}", e));
        }

        self.check_outbounds(config, &mut result);
        self.check_inbounds(&config.inbounds, &mut result);
        self.check_dns(config, &mut result);
        self.check_route(config, &mut result);
        self.suggest(config, &mut result);

        result.valid = result.errors.is_empty();
        result
    }

    fn check_outbounds(&self, config: &EngineConfig, result: &mut ValidationResult) {
        if config.outbounds.is_empty() {
            result.error("outbounds", "", "required", "at least one outbound is required");
            return;
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, outbound) in config.outbounds.iter().enumerate() {
            let field = format!("outbounds[{}]", i);

            if outbound.tag.is_empty() {
                result.error(format!("{}.tag", field), "", "required", "tag is required");
            } else if let Some(first) = seen.get(outbound.tag.as_str()) {
                result.error(
                    format!("{}.tag", field),
                    outbound.tag.clone(),
                    "unique",
                    format!(
                        "duplicate tag '{}' at outbounds[{}] and outbounds[{}]",
                        outbound.tag, first, i
                    ),
                );
            } else {
                seen.insert(outbound.tag.as_str(), i);
            }

            if !OUTBOUND_TYPES.contains(&outbound.kind.as_str()) {
                result.error(
                    format!("{}.type", field),
                    outbound.kind.clone(),
                    "enum",
                    format!("unsupported outbound type '{}'", outbound.kind),
                );
                continue;
            }

            if PROXY_TYPES.contains(&outbound.kind.as_str()) {
                self.check_endpoint(&field, outbound, result);
            }
            self.check_protocol_fields(&field, outbound, result);
        }

        // group members must exist; dangling names only degrade selection
        let tags: HashSet<&str> = config.outbounds.iter().map(|o| o.tag.as_str()).collect();
        for (i, outbound) in config.outbounds.iter().enumerate() {
            for member in outbound.outbounds.iter().flatten() {
                if !tags.contains(member.as_str()) {
                    result.warning(
                        format!("outbounds[{}].outbounds", i),
                        member.clone(),
                        "reference",
                        format!("group member '{}' does not exist", member),
                    );
                }
            }
        }
    }

    fn check_endpoint(&self, field: &str, outbound: &Outbound, result: &mut ValidationResult) {
        match outbound.server.as_deref() {
            None | Some("") => {
                result.error(format!("{}.server", field), "", "required", "server is required")
            }
            Some(server) if !is_valid_host(server) => result.error(
                format!("{}.server", field),
                server,
                "host",
                format!("'{}' is not a valid hostname or IP address", server),
            ),
            Some(_) => {}
        }

        match outbound.server_port {
            None => result.error(
                format!("{}.server_port", field),
                "",
                "required",
                "server_port is required",
            ),
            Some(port) if !(1..=65535).contains(&port) => result.error(
                format!("{}.server_port", field),
                port.to_string(),
                "range",
                format!("server_port must be between 1 and 65535, got {}", port),
            ),
            Some(_) => {}
        }
    }

    fn check_protocol_fields(&self, field: &str, outbound: &Outbound, result: &mut ValidationResult) {
        match outbound.kind.as_str() {
            "vmess" | "vless" | "tuic" => {
                match outbound.uuid.as_deref() {
                    None | Some("") => {
                        result.error(format!("{}.uuid", field), "", "required", "uuid is required")
                    }
                    Some(uuid) if !is_uuid(uuid) => result.error(
                        format!("{}.uuid", field),
                        uuid,
                        "uuid",
                        format!("'{}' is not a valid UUID", uuid),
                    ),
                    Some(_) => {}
                }
                if outbound.kind == "vmess" {
                    if let Some(security) = outbound.security.as_deref() {
                        if !VMESS_SECURITIES.contains(&security) {
                            result.error(
                                format!("{}.security", field),
                                security,
                                "enum",
                                format!("unsupported vmess security '{}'", security),
                            );
                        }
                    }
                }
                if outbound.kind == "vless" {
                    if let Some(flow) = outbound.flow.as_deref() {
                        if !VLESS_FLOWS.contains(&flow) {
                            result.error(
                                format!("{}.flow", field),
                                flow,
                                "enum",
                                format!("unsupported vless flow '{}'", flow),
                            );
                        }
                    }
                }
            }
            "trojan" => {
                self.require_password(field, outbound, result);
                if !outbound.tls.as_ref().map(|t| t.enabled).unwrap_or(false) {
                    result.error(
                        format!("{}.tls", field),
                        "",
                        "required",
                        "trojan requires tls to be enabled",
                    );
                }
            }
            "shadowsocks" => {
                match outbound.method.as_deref() {
                    None | Some("") => {
                        result.error(format!("{}.method", field), "", "required", "method is required")
                    }
                    Some(method) if !SHADOWSOCKS_METHODS.contains(&method) => result.error(
                        format!("{}.method", field),
                        method,
                        "enum",
                        format!("unsupported shadowsocks method '{}'", method),
                    ),
                    Some(_) => {}
                }
                self.require_password(field, outbound, result);
            }
            "hysteria2" | "anytls" => self.require_password(field, outbound, result),
            "hysteria" => {
                let has_auth = outbound
                    .extra
                    .get("auth_str")
                    .and_then(Value::as_str)
                    .map(|s| !s.is_empty())
                    .unwrap_or(false);
                if !has_auth {
                    result.error(format!("{}.auth_str", field), "", "required", "auth_str is required");
                }
            }
            _ => {}
        }
    }

    fn require_password(&self, field: &str, outbound: &Outbound, result: &mut ValidationResult) {
        if outbound.password.as_deref().map(str::is_empty).unwrap_or(true) {
            result.error(format!("{}.password", field), "", "required", "password is required");
        }
    }

    fn check_inbounds(&self, inbounds: &[Inbound], result: &mut ValidationResult) {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, inbound) in inbounds.iter().enumerate() {
            let field = format!("inbounds[{}]", i);

            if !INBOUND_TYPES.contains(&inbound.kind.as_str()) {
                result.error(
                    format!("{}.type", field),
                    inbound.kind.clone(),
                    "enum",
                    format!("unsupported inbound type '{}'", inbound.kind),
                );
            }

            if inbound.tag.is_empty() {
                result.error(format!("{}.tag", field), "", "required", "tag is required");
            } else if let Some(first) = seen.get(inbound.tag.as_str()) {
                result.error(
                    format!("{}.tag", field),
                    inbound.tag.clone(),
                    "unique",
                    format!(
                        "duplicate tag '{}' at inbounds[{}] and inbounds[{}]",
                        inbound.tag, first, i
                    ),
                );
            } else {
                seen.insert(inbound.tag.as_str(), i);
            }

            if let Some(listen) = inbound.listen.as_deref() {
                if listen.parse::<IpAddr>().is_err() {
                    result.error(
                        format!("{}.listen", field),
                        listen,
                        "ip",
                        format!("listen address '{}' is not an IP address", listen),
                    );
                }
            }

            if let Some(port) = inbound.listen_port {
                if !(1..=65535).contains(&port) {
                    result.error(
                        format!("{}.listen_port", field),
                        port.to_string(),
                        "range",
                        format!("listen_port must be between 1 and 65535, got {}", port),
                    );
                }
            }
        }
    }

    fn check_dns(&self, config: &EngineConfig, result: &mut ValidationResult) {
        let Some(dns) = &config.dns else {
            return;
        };
        let tags: HashSet<&str> = config.outbounds.iter().map(|o| o.tag.as_str()).collect();
        let servers: HashSet<&str> = dns.servers.iter().map(|s| s.tag.as_str()).collect();

        for (i, server) in dns.servers.iter().enumerate() {
            if server.address.is_empty() {
                result.warning(
                    format!("dns.servers[{}].address", i),
                    "",
                    "required",
                    "dns server has no address",
                );
            }
            if let Some(detour) = server.detour.as_deref() {
                if !tags.contains(detour) {
                    result.warning(
                        format!("dns.servers[{}].detour", i),
                        detour,
                        "reference",
                        format!("detour outbound '{}' does not exist", detour),
                    );
                }
            }
        }
        for (i, rule) in dns.rules.iter().enumerate() {
            if !servers.contains(rule.server.as_str()) {
                result.warning(
                    format!("dns.rules[{}].server", i),
                    rule.server.clone(),
                    "reference",
                    format!("dns server '{}' does not exist", rule.server),
                );
            }
        }
        if let Some(final_server) = dns.final_server.as_deref() {
            if !servers.contains(final_server) {
                result.warning("dns.final", final_server, "reference", "final dns server does not exist");
            }
        }
    }

    fn check_route(&self, config: &EngineConfig, result: &mut ValidationResult) {
        let Some(route) = &config.route else {
            return;
        };
        let tags: HashSet<&str> = config.outbounds.iter().map(|o| o.tag.as_str()).collect();

        for (i, rule) in route.rules.iter().enumerate() {
            if !tags.contains(rule.outbound.as_str()) {
                result.warning(
                    format!("route.rules[{}].outbound", i),
                    rule.outbound.clone(),
                    "reference",
                    format!("route outbound '{}' does not exist", rule.outbound),
                );
            }
        }
        if let Some(final_outbound) = route.final_outbound.as_deref() {
            if !tags.contains(final_outbound) {
                result.warning(
                    "route.final",
                    final_outbound,
                    "reference",
                    format!("final outbound '{}' does not exist", final_outbound),
                );
            }
        }
    }

    fn suggest(&self, config: &EngineConfig, result: &mut ValidationResult) {
        if config.inbounds.is_empty() {
            result
                .suggestions
                .push("add an inbound (for example a mixed listener) so local clients can connect".to_string());
        }
        if config.dns.is_none() {
            result
                .suggestions
                .push("add a dns section to avoid leaking queries to the system resolver".to_string());
        }
        if config.route.is_none() {
            result
                .suggestions
                .push("add route rules to keep private and domestic traffic direct".to_string());
        }
        let has_proxy = config
            .outbounds
            .iter()
            .any(|o| PROXY_TYPES.contains(&o.kind.as_str()));
        let has_selector = config.outbounds.iter().any(|o| o.kind == "selector");
        if has_proxy && !has_selector {
            result
                .suggestions
                .push("add a selector outbound to switch between proxy outbounds".to_string());
        }
    }
}
