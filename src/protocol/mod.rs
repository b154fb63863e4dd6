//! Protocol adapters: validation and normalization of node parameters.

mod adapters;
mod normalize;
pub mod params;
mod registry;

use std::fmt;

use serde_json::Value;

pub use adapters::ProtocolAdapter;
pub use params::{
    Network, ProtocolParams, ShadowsocksParams, TlsOptions, Transport,
};
pub use registry::AdapterRegistry;

/// Ciphers accepted for shadowsocks nodes.
pub const SHADOWSOCKS_METHODS: &[&str] = &[
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
];

pub const VMESS_SECURITIES: &[&str] = &["auto", "aes-128-gcm", "chacha20-poly1305", "none"];

pub const VLESS_FLOWS: &[&str] = &["", "xtls-rprx-vision", "xtls-rprx-vision-udp443"];

pub const UTLS_FINGERPRINTS: &[&str] = &[
    "chrome",
    "firefox",
    "safari",
    "ios",
    "android",
    "edge",
    "360",
    "qq",
    "random",
    "randomized",
];

/// Whether a shadowsocks method belongs to the AEAD-2022 family.
pub fn is_ss2022(method: &str) -> bool {
    method.starts_with("2022-blake3-")
}

/// A protocol parameter failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolParamError {
    pub protocol: String,
    pub param: String,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub message: Option<String>,
}

impl ProtocolParamError {
    pub fn invalid(protocol: &str, param: &str, message: impl Into<String>) -> Self {
        Self {
            protocol: protocol.to_string(),
            param: param.to_string(),
            expected: None,
            actual: None,
            message: Some(message.into()),
        }
    }

    pub fn mismatch(protocol: &str, param: &str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self {
            protocol: protocol.to_string(),
            param: param.to_string(),
            expected: Some(expected.into()),
            actual: Some(actual.into()),
            message: None,
        }
    }

    pub fn missing(protocol: &str, param: &str) -> Self {
        Self::invalid(protocol, param, "required parameter is missing")
    }

    pub fn unsupported(protocol: &str) -> Self {
        Self::invalid(protocol, "protocol", format!("unsupported protocol: {}", protocol))
    }
}

impl fmt::Display for ProtocolParamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(
                f,
                "protocol {} parameter error for '{}': {}",
                self.protocol, self.param, message
            ),
            None => write!(
                f,
                "protocol {} parameter error for '{}': expected {}, got {}",
                self.protocol,
                self.param,
                self.expected.as_deref().unwrap_or("?"),
                self.actual.as_deref().unwrap_or("?")
            ),
        }
    }
}

impl std::error::Error for ProtocolParamError {}

/// JSON kind name used in mismatch errors.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Canonical textual UUID (8-4-4-4-12 hex groups).
pub fn is_uuid(value: &str) -> bool {
    value.len() == 36 && value.matches('-').count() == 4 && uuid::Uuid::parse_str(value).is_ok()
}
