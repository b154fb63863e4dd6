//! Shared readers for raw parameter maps and TLS/transport normalization.

use serde_json::{Map, Value};

use super::params::{Network, RealityOptions, TlsOptions, Transport, UtlsOptions};
use super::{value_kind, ProtocolParamError, UTLS_FINGERPRINTS};

pub(crate) type RawParams = Map<String, Value>;

/// Required non-empty string.
pub(crate) fn require_str<'a>(
    protocol: &str,
    raw: &'a RawParams,
    key: &str,
) -> Result<&'a str, ProtocolParamError> {
    match raw.get(key) {
        None | Some(Value::Null) => Err(ProtocolParamError::missing(protocol, key)),
        Some(Value::String(s)) if s.is_empty() => {
            Err(ProtocolParamError::invalid(protocol, key, "must not be empty"))
        }
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(ProtocolParamError::mismatch(protocol, key, "string", value_kind(other))),
    }
}

/// Optional string; present values must be strings.
pub(crate) fn opt_str<'a>(
    protocol: &str,
    raw: &'a RawParams,
    key: &str,
) -> Result<Option<&'a str>, ProtocolParamError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(ProtocolParamError::mismatch(protocol, key, "string", value_kind(other))),
    }
}

/// Optional non-negative integer. Numeric strings are accepted.
pub(crate) fn opt_u64(
    protocol: &str,
    raw: &RawParams,
    key: &str,
) -> Result<Option<u64>, ProtocolParamError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .map(Some)
            .ok_or_else(|| {
                ProtocolParamError::invalid(protocol, key, format!("must be a non-negative integer, got {}", n))
            }),
        Some(Value::String(s)) => s.trim().parse::<u64>().map(Some).map_err(|_| {
            ProtocolParamError::mismatch(protocol, key, "integer", format!("'{}'", s))
        }),
        Some(other) => Err(ProtocolParamError::mismatch(protocol, key, "integer", value_kind(other))),
    }
}

pub(crate) fn opt_bool(
    protocol: &str,
    raw: &RawParams,
    key: &str,
) -> Result<Option<bool>, ProtocolParamError> {
    match raw.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(ProtocolParamError::mismatch(protocol, key, "boolean", value_kind(other))),
    }
}

pub(crate) fn one_of(
    protocol: &str,
    key: &str,
    value: &str,
    allowed: &[&str],
) -> Result<(), ProtocolParamError> {
    if allowed.contains(&value) {
        return Ok(());
    }
    let listed: Vec<&str> = allowed.iter().map(|a| if a.is_empty() { "\"\"" } else { a }).collect();
    Err(ProtocolParamError::mismatch(
        protocol,
        key,
        format!("one of {}", listed.join(", ")),
        format!("'{}'", value),
    ))
}

/// Strings or a single string.
fn string_list(protocol: &str, key: &str, value: &Value) -> Result<Vec<String>, ProtocolParamError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(ProtocolParamError::invalid(
                    protocol,
                    key,
                    format!("entries must be strings, got {}", value_kind(other)),
                )),
            })
            .collect(),
        other => Err(ProtocolParamError::mismatch(protocol, key, "string or array", value_kind(other))),
    }
}

fn first_str<'a>(sources: &[&'a RawParams], keys: &[&str]) -> Option<&'a str> {
    sources.iter().find_map(|map| {
        keys.iter()
            .find_map(|k| map.get(*k).and_then(Value::as_str).filter(|s| !s.is_empty()))
    })
}

/// Which optional TLS features a protocol understands.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TlsFeatures {
    /// TLS is always on regardless of input.
    pub forced: bool,
    pub utls: bool,
    pub reality: bool,
}

/// Normalize `tls` (bool or object) plus top-level `sni`/`server_name`/
/// `allow_insecure`/`alpn` fallbacks.
pub(crate) fn parse_tls(
    protocol: &str,
    raw: &RawParams,
    features: TlsFeatures,
) -> Result<Option<TlsOptions>, ProtocolParamError> {
    let empty = Map::new();
    let (enabled, section) = match raw.get("tls") {
        None | Some(Value::Null) => (features.forced, &empty),
        Some(Value::Bool(b)) => (*b || features.forced, &empty),
        Some(Value::Object(obj)) => {
            let enabled = opt_bool(protocol, obj, "enabled")?.unwrap_or(true);
            (enabled || features.forced, obj)
        }
        Some(other) => {
            return Err(ProtocolParamError::mismatch(
                protocol,
                "tls",
                "boolean or object",
                value_kind(other),
            ))
        }
    };
    if !enabled {
        return Ok(None);
    }

    let sources = [section, raw];
    let mut tls = TlsOptions::enabled();
    tls.server_name = first_str(&sources, &["server_name", "sni"]).map(str::to_string);

    for source in sources {
        let insecure = match opt_bool(protocol, source, "insecure")? {
            Some(v) => Some(v),
            None => opt_bool(protocol, source, "allow_insecure")?,
        };
        if let Some(v) = insecure {
            tls.insecure = v;
            break;
        }
    }

    if let Some(alpn) = section.get("alpn").or_else(|| raw.get("alpn")) {
        tls.alpn = string_list(protocol, "alpn", alpn)?;
    }

    if features.utls {
        let fingerprint = section
            .get("utls")
            .and_then(Value::as_object)
            .and_then(|u| u.get("fingerprint"))
            .and_then(Value::as_str)
            .or_else(|| first_str(&sources, &["fingerprint"]))
            .unwrap_or("chrome");
        one_of(protocol, "fingerprint", fingerprint, UTLS_FINGERPRINTS)?;
        tls.utls = Some(UtlsOptions {
            enabled: true,
            fingerprint: fingerprint.to_string(),
        });
    }

    if features.reality {
        let reality = section.get("reality").or_else(|| raw.get("reality"));
        match reality {
            None | Some(Value::Null) => {}
            Some(Value::Object(obj)) => {
                if opt_bool(protocol, obj, "enabled")?.unwrap_or(true) {
                    let public_key = match obj.get("public_key").and_then(Value::as_str) {
                        Some(key) if !key.is_empty() => key.to_string(),
                        _ => {
                            return Err(ProtocolParamError::invalid(
                                protocol,
                                "reality.public_key",
                                "public_key is required when reality is enabled",
                            ))
                        }
                    };
                    tls.reality = Some(RealityOptions {
                        enabled: true,
                        public_key,
                        short_id: opt_str(protocol, obj, "short_id")?.unwrap_or_default().to_string(),
                    });
                }
            }
            Some(other) => {
                return Err(ProtocolParamError::mismatch(protocol, "reality", "object", value_kind(other)))
            }
        }
    }

    Ok(Some(tls))
}

/// Normalize `network` + `network_settings` into a transport.
pub(crate) fn parse_transport(
    protocol: &str,
    raw: &RawParams,
) -> Result<Option<Transport>, ProtocolParamError> {
    let Some(name) = opt_str(protocol, raw, "network")? else {
        return Ok(None);
    };
    let network = Network::parse(name).ok_or_else(|| {
        ProtocolParamError::mismatch(protocol, "network", "one of tcp, ws, grpc, h2, quic", format!("'{}'", name))
    })?;

    let empty = Map::new();
    let settings = match raw.get("network_settings") {
        None | Some(Value::Null) => &empty,
        Some(Value::Object(obj)) => obj,
        Some(other) => {
            return Err(ProtocolParamError::mismatch(
                protocol,
                "network_settings",
                "object",
                value_kind(other),
            ))
        }
    };

    let mut transport = Transport::new(network);
    match network {
        Network::Tcp => {
            let header_type = settings
                .get("header")
                .and_then(Value::as_object)
                .and_then(|h| h.get("type"))
                .and_then(Value::as_str);
            if header_type != Some("http") {
                return Ok(None);
            }
            transport.header_type = Some("http".to_string());
            transport.path = Some("/".to_string());
        }
        Network::Ws => {
            transport.path = Some(opt_str(protocol, settings, "path")?.unwrap_or("/").to_string());
            let host = settings
                .get("headers")
                .and_then(Value::as_object)
                .and_then(|h| h.get("Host").or_else(|| h.get("host")))
                .or_else(|| settings.get("host"));
            if let Some(host) = host {
                transport.host = string_list(protocol, "network_settings.host", host)?;
            }
        }
        Network::Grpc => {
            let service = first_str(&[settings], &["serviceName", "service_name"]).unwrap_or("TunService");
            transport.service_name = Some(service.to_string());
        }
        Network::H2 => {
            transport.path = Some(opt_str(protocol, settings, "path")?.unwrap_or("/").to_string());
            if let Some(host) = settings.get("host") {
                transport.host = string_list(protocol, "network_settings.host", host)?;
            }
        }
        Network::Quic => {
            transport.security = Some(opt_str(protocol, settings, "security")?.unwrap_or("none").to_string());
        }
    }
    Ok(Some(transport))
}
