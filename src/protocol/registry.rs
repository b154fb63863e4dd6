//! Adapter registry, constructed once and shared by reference.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::adapters::{
    AnyTlsAdapter, Hysteria2Adapter, HysteriaAdapter, ProtocolAdapter, ShadowsocksAdapter,
    TrojanAdapter, TuicAdapter, VlessAdapter, VmessAdapter,
};
use super::params::ProtocolParams;
use super::ProtocolParamError;

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProtocolAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in protocol.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(VmessAdapter));
        registry.register(Arc::new(VlessAdapter));
        registry.register(Arc::new(TrojanAdapter));
        registry.register(Arc::new(ShadowsocksAdapter));
        registry.register(Arc::new(HysteriaAdapter));
        registry.register(Arc::new(Hysteria2Adapter));
        registry.register(Arc::new(TuicAdapter));
        registry.register(Arc::new(AnyTlsAdapter));
        registry
    }

    /// Add or replace the adapter for its protocol.
    pub fn register(&mut self, adapter: Arc<dyn ProtocolAdapter>) {
        self.adapters.insert(adapter.protocol().to_lowercase(), adapter);
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolAdapter>> {
        self.adapters.get(&protocol.to_lowercase()).cloned()
    }

    pub fn supported_protocols(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }

    fn adapter(&self, protocol: &str) -> Result<Arc<dyn ProtocolAdapter>, ProtocolParamError> {
        self.get(protocol)
            .ok_or_else(|| ProtocolParamError::unsupported(protocol))
    }

    pub fn validate(&self, protocol: &str, raw: &Map<String, Value>) -> Result<(), ProtocolParamError> {
        self.adapter(protocol)?.validate_params(raw)
    }

    pub fn convert(
        &self,
        protocol: &str,
        raw: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ProtocolParamError> {
        self.adapter(protocol)?.convert_params(raw)
    }

    /// Validate and produce typed parameters.
    pub fn parse(&self, protocol: &str, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        self.adapter(protocol)?.parse(raw)
    }
}
