//! sing-box client profile: the engine config itself.

use super::ProxyDescriptor;
use crate::engine::{ConfigGenerator, GenerateOptions, NodeDescriptor};

pub fn render(proxies: &[ProxyDescriptor], options: &GenerateOptions) -> Result<String, serde_json::Error> {
    let nodes: Vec<NodeDescriptor> = proxies
        .iter()
        .map(|p| NodeDescriptor {
            tag: p.name.clone(),
            server: p.server.clone(),
            port: p.port,
            params: p.params.clone(),
        })
        .collect();

    let generated = ConfigGenerator::new().generate_config(&nodes, options);
    generated.config.to_json()
}
