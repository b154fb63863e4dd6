//! Engine configuration generation from node descriptors.

use serde_json::{json, Map};
use tracing::debug;

use super::model::{
    DnsConfig, DnsRule, DnsServer, EngineConfig, Inbound, LogConfig, Outbound, RouteConfig,
    RouteRule,
};
use super::validator::{ConfigValidator, ValidationResult};
use crate::config::GeneratorConfig;
use crate::protocol::ProtocolParams;

pub const PROXY_TAG: &str = "proxy";
pub const AUTO_TAG: &str = "auto";
pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const DNS_TAG: &str = "dns-out";
pub const INBOUND_TAG: &str = "mixed-in";

/// Outbound tags the generator adds itself. Node names may not use them.
pub const RESERVED_TAGS: &[&str] = &[PROXY_TAG, AUTO_TAG, DIRECT_TAG, BLOCK_TAG, DNS_TAG];

const URLTEST_URL: &str = "https://www.gstatic.com/generate_204";

/// One node as seen by the generator.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    pub tag: String,
    pub server: String,
    pub port: u16,
    pub params: ProtocolParams,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub local_port: u16,
    pub log_level: String,
    pub enable_dns: bool,
    pub enable_route: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self::from(&GeneratorConfig::default())
    }
}

impl From<&GeneratorConfig> for GenerateOptions {
    fn from(config: &GeneratorConfig) -> Self {
        Self {
            local_port: config.local_port,
            log_level: config.log_level.clone(),
            enable_dns: config.enable_dns,
            enable_route: config.enable_route,
        }
    }
}

/// Generated document together with its validation outcome.
#[derive(Debug, Clone)]
pub struct GeneratedConfig {
    pub config: EngineConfig,
    pub validation: ValidationResult,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigGenerator {
    validator: ConfigValidator,
}

impl ConfigGenerator {
    pub fn new() -> Self {
        Self {
            validator: ConfigValidator::new(),
        }
    }

    pub fn validator(&self) -> &ConfigValidator {
        &self.validator
    }

    /// Build a full engine config with one outbound per node, then validate it.
    pub fn generate_config(&self, nodes: &[NodeDescriptor], options: &GenerateOptions) -> GeneratedConfig {
        let mut config = EngineConfig {
            log: Some(LogConfig {
                level: options.log_level.clone(),
                timestamp: true,
            }),
            dns: options.enable_dns.then(dns_section),
            inbounds: vec![mixed_inbound(options.local_port)],
            outbounds: Vec::with_capacity(nodes.len() + 5),
            route: options.enable_route.then(route_section),
        };

        let node_tags: Vec<String> = nodes.iter().map(|n| n.tag.clone()).collect();
        for node in nodes {
            config
                .outbounds
                .push(node.params.to_outbound(&node.tag, &node.server, node.port));
        }
        config.outbounds.extend(group_outbounds(&node_tags));
        config.outbounds.extend(builtin_outbounds());

        let validation = self.validator.validate(&config);
        debug!(
            nodes = nodes.len(),
            valid = validation.valid,
            errors = validation.errors.len(),
            "Generated engine config"
        );
        GeneratedConfig { config, validation }
    }
}

fn dns_section() -> DnsConfig {
    DnsConfig {
        servers: vec![
            DnsServer::new("google", "https://dns.google/dns-query", None),
            DnsServer::new("cloudflare", "https://cloudflare-dns.com/dns-query", Some(PROXY_TAG)),
            DnsServer::new("alidns", "https://dns.alidns.com/dns-query", Some(DIRECT_TAG)),
            DnsServer::new("local", "223.5.5.5", Some(DIRECT_TAG)),
        ],
        rules: vec![
            DnsRule {
                domain_suffix: vec![".cn".to_string()],
                server: "local".to_string(),
                ..Default::default()
            },
            DnsRule {
                geosite: vec!["cn".to_string()],
                server: "local".to_string(),
                ..Default::default()
            },
        ],
        final_server: Some("google".to_string()),
    }
}

fn mixed_inbound(port: u16) -> Inbound {
    let mut extra = Map::new();
    extra.insert("sniff".to_string(), json!(true));
    Inbound {
        kind: "mixed".to_string(),
        tag: INBOUND_TAG.to_string(),
        listen: Some("127.0.0.1".to_string()),
        listen_port: Some(i64::from(port)),
        extra,
    }
}

fn route_section() -> RouteConfig {
    RouteConfig {
        rules: vec![
            RouteRule {
                protocol: Some("dns".to_string()),
                ..RouteRule::to(DNS_TAG)
            },
            RouteRule {
                ip_is_private: Some(true),
                ..RouteRule::to(DIRECT_TAG)
            },
            RouteRule {
                geosite: vec!["cn".to_string()],
                ..RouteRule::to(DIRECT_TAG)
            },
            RouteRule {
                geoip: vec!["cn".to_string()],
                ..RouteRule::to(DIRECT_TAG)
            },
        ],
        final_outbound: Some(PROXY_TAG.to_string()),
        auto_detect_interface: true,
    }
}

fn group_outbounds(node_tags: &[String]) -> Vec<Outbound> {
    let mut groups = Vec::with_capacity(2);
    if node_tags.is_empty() {
        let mut selector = Outbound::new("selector", PROXY_TAG);
        selector.outbounds = Some(vec![DIRECT_TAG.to_string()]);
        groups.push(selector);
        return groups;
    }

    let mut members = Vec::with_capacity(node_tags.len() + 2);
    members.push(AUTO_TAG.to_string());
    members.extend(node_tags.iter().cloned());
    members.push(DIRECT_TAG.to_string());
    let mut selector = Outbound::new("selector", PROXY_TAG).with_extra("default", AUTO_TAG);
    selector.outbounds = Some(members);
    groups.push(selector);

    let mut urltest = Outbound::new("urltest", AUTO_TAG)
        .with_extra("url", URLTEST_URL)
        .with_extra("interval", "5m")
        .with_extra("tolerance", 50);
    urltest.outbounds = Some(node_tags.to_vec());
    groups.push(urltest);
    groups
}

fn builtin_outbounds() -> Vec<Outbound> {
    vec![
        Outbound::new("direct", DIRECT_TAG),
        Outbound::new("block", BLOCK_TAG),
        Outbound::new("dns", DNS_TAG),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AdapterRegistry;
    use serde_json::Value;

    fn node(tag: &str, protocol: &str, raw: Value) -> NodeDescriptor {
        NodeDescriptor {
            tag: tag.to_string(),
            server: "node.example.com".to_string(),
            port: 443,
            params: AdapterRegistry::with_defaults()
                .parse(protocol, raw.as_object().unwrap())
                .unwrap(),
        }
    }

    fn sample_nodes() -> Vec<NodeDescriptor> {
        vec![
            node("vm", "vmess", json!({"uuid": "b831381d-6324-4d53-ad4f-8cda48b30811"})),
            node("vl", "vless", json!({"uuid": "b831381d-6324-4d53-ad4f-8cda48b30811", "flow": "xtls-rprx-vision", "tls": true})),
            node("tj", "trojan", json!({"password": "pw"})),
            node("ss", "shadowsocks", json!({"method": "aes-256-gcm", "password": "pw"})),
        ]
    }

    #[test]
    fn test_generated_config_is_valid() {
        let generated = ConfigGenerator::new().generate_config(&sample_nodes(), &GenerateOptions::default());
        assert!(generated.validation.valid, "{:?}", generated.validation.errors);
        assert!(generated.validation.warnings.is_empty());

        let tags: Vec<&str> = generated.config.outbounds.iter().map(|o| o.tag.as_str()).collect();
        assert_eq!(tags, vec!["vm", "vl", "tj", "ss", "proxy", "auto", "direct", "block", "dns-out"]);

        let selector = generated.config.outbound(PROXY_TAG).unwrap();
        assert_eq!(
            selector.outbounds.as_deref().unwrap(),
            ["auto", "vm", "vl", "tj", "ss", "direct"]
        );
        assert_eq!(generated.config.inbounds[0].listen_port, Some(7890));
    }

    #[test]
    fn test_removing_required_field_yields_one_error() {
        let generator = ConfigGenerator::new();
        let mut generated = generator.generate_config(&sample_nodes(), &GenerateOptions::default());
        generated.config.outbounds[1].uuid = None;

        let result = generator.validator().validate(&generated.config);
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].field, "outbounds[1].uuid");
    }

    #[test]
    fn test_options_disable_sections() {
        let options = GenerateOptions {
            local_port: 1080,
            log_level: "warn".to_string(),
            enable_dns: false,
            enable_route: false,
        };
        let generated = ConfigGenerator::new().generate_config(&sample_nodes(), &options);
        assert!(generated.config.dns.is_none());
        assert!(generated.config.route.is_none());
        assert!(generated.validation.valid);

        let json: Value = serde_json::from_str(&generated.config.to_json().unwrap()).unwrap();
        assert_eq!(json["log"]["level"], "warn");
        assert_eq!(json["inbounds"][0]["listen_port"], 1080);
        assert!(json.get("dns").is_none());
    }

    #[test]
    fn test_no_nodes_still_routable() {
        let generated = ConfigGenerator::new().generate_config(&[], &GenerateOptions::default());
        assert!(generated.validation.valid);
        assert!(generated.config.outbound(AUTO_TAG).is_none());
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let mut nodes = sample_nodes();
        nodes[3].tag = "vm".to_string();
        let generated = ConfigGenerator::new().generate_config(&nodes, &GenerateOptions::default());
        assert!(!generated.validation.valid);
        assert_eq!(generated.validation.errors[0].field, "outbounds[3].tag");
    }
}
