//! Per-protocol adapters.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

use super::normalize::{
    one_of, opt_str, opt_u64, parse_tls, parse_transport, require_str, RawParams, TlsFeatures,
};
use super::params::{
    AnyTlsParams, Hysteria2Params, HysteriaParams, ProtocolParams, ShadowsocksParams,
    TrojanParams, TuicParams, VlessParams, VmessParams,
};
use super::{is_uuid, ProtocolParamError, SHADOWSOCKS_METHODS, VLESS_FLOWS, VMESS_SECURITIES};
use crate::crypto::ss2022::key_size;

const SHADOWSOCKS_PLUGINS: &[&str] = &["obfs-local", "v2ray-plugin", "kcptun", "simple-obfs"];
const TUIC_CONGESTION: &[&str] = &["cubic", "new_reno", "bbr"];
const TUIC_RELAY_MODES: &[&str] = &["native", "quic"];

/// Validation and normalization contract for one protocol.
///
/// Implementors only provide `parse`; validation and canonical conversion are
/// both derived from it so they can never disagree.
pub trait ProtocolAdapter: Send + Sync {
    fn protocol(&self) -> &'static str;

    fn required_params(&self) -> &'static [&'static str];

    fn optional_params(&self) -> &'static [&'static str];

    /// Validate and normalize into the typed form.
    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError>;

    fn validate_params(&self, raw: &Map<String, Value>) -> Result<(), ProtocolParamError> {
        self.parse(raw).map(|_| ())
    }

    /// Canonical map with defaults applied.
    fn convert_params(&self, raw: &Map<String, Value>) -> Result<Map<String, Value>, ProtocolParamError> {
        self.parse(raw)?
            .to_canonical()
            .map_err(|e| ProtocolParamError::invalid(self.protocol(), "params", e.to_string()))
    }
}

fn require_uuid<'a>(protocol: &str, raw: &'a RawParams) -> Result<&'a str, ProtocolParamError> {
    let uuid = require_str(protocol, raw, "uuid")?;
    if !is_uuid(uuid) {
        return Err(ProtocolParamError::mismatch(
            protocol,
            "uuid",
            "UUID (xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx)",
            format!("'{}'", uuid),
        ));
    }
    Ok(uuid)
}

fn opt_mbps(protocol: &str, raw: &RawParams, key: &str) -> Result<Option<u32>, ProtocolParamError> {
    match opt_u64(protocol, raw, key)? {
        None => Ok(None),
        Some(v) => u32::try_from(v)
            .map(Some)
            .map_err(|_| ProtocolParamError::invalid(protocol, key, "bandwidth is too large")),
    }
}

pub struct VmessAdapter;

impl ProtocolAdapter for VmessAdapter {
    fn protocol(&self) -> &'static str {
        "vmess"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["uuid"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["alter_id", "security", "tls", "network", "network_settings"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let uuid = require_uuid(p, raw)?;

        let alter_id = match opt_u64(p, raw, "alter_id")? {
            None => 0,
            Some(v) if v <= 65535 => v as u16,
            Some(v) => {
                return Err(ProtocolParamError::invalid(
                    p,
                    "alter_id",
                    format!("must be between 0 and 65535, got {}", v),
                ))
            }
        };

        let security = opt_str(p, raw, "security")?.unwrap_or("auto");
        one_of(p, "security", security, VMESS_SECURITIES)?;

        Ok(ProtocolParams::Vmess(VmessParams {
            uuid: uuid.to_string(),
            alter_id,
            security: security.to_string(),
            tls: parse_tls(p, raw, TlsFeatures::default())?,
            transport: parse_transport(p, raw)?,
        }))
    }
}

pub struct VlessAdapter;

impl ProtocolAdapter for VlessAdapter {
    fn protocol(&self) -> &'static str {
        "vless"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["uuid"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["flow", "encryption", "tls", "reality", "network", "network_settings"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let uuid = require_uuid(p, raw)?;

        let flow = opt_str(p, raw, "flow")?.unwrap_or("");
        one_of(p, "flow", flow, VLESS_FLOWS)?;

        let encryption = opt_str(p, raw, "encryption")?.unwrap_or("none");
        if encryption != "none" {
            return Err(ProtocolParamError::mismatch(p, "encryption", "'none'", format!("'{}'", encryption)));
        }

        let features = TlsFeatures {
            forced: false,
            utls: true,
            reality: true,
        };
        Ok(ProtocolParams::Vless(VlessParams {
            uuid: uuid.to_string(),
            flow: flow.to_string(),
            encryption: "none".to_string(),
            packet_encoding: "xudp".to_string(),
            tls: parse_tls(p, raw, features)?,
            transport: parse_transport(p, raw)?,
        }))
    }
}

pub struct TrojanAdapter;

impl ProtocolAdapter for TrojanAdapter {
    fn protocol(&self) -> &'static str {
        "trojan"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["password"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["sni", "server_name", "allow_insecure", "alpn", "tls", "network", "network_settings"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let password = require_str(p, raw, "password")?;
        let forced = TlsFeatures {
            forced: true,
            ..Default::default()
        };
        let tls = parse_tls(p, raw, forced)?
            .ok_or_else(|| ProtocolParamError::invalid(p, "tls", "trojan requires TLS"))?;

        Ok(ProtocolParams::Trojan(TrojanParams {
            password: password.to_string(),
            tls,
            transport: parse_transport(p, raw)?,
        }))
    }
}

pub struct ShadowsocksAdapter;

impl ProtocolAdapter for ShadowsocksAdapter {
    fn protocol(&self) -> &'static str {
        "shadowsocks"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["method", "password"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["plugin", "plugin_opts"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let method = require_str(p, raw, "method")?;
        one_of(p, "method", method, SHADOWSOCKS_METHODS)?;
        let password = require_str(p, raw, "password")?;
        if let Some(size) = key_size(method) {
            check_psk(p, method, password, size)?;
        }

        let plugin = opt_str(p, raw, "plugin")?.filter(|s| !s.is_empty());
        if let Some(plugin) = plugin {
            one_of(p, "plugin", plugin, SHADOWSOCKS_PLUGINS)?;
        }

        Ok(ProtocolParams::Shadowsocks(ShadowsocksParams {
            method: method.to_string(),
            password: password.to_string(),
            plugin: plugin.map(str::to_string),
            plugin_opts: opt_str(p, raw, "plugin_opts")?
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        }))
    }
}

/// AEAD-2022 server keys are base64 of exactly `size` bytes.
fn check_psk(protocol: &str, method: &str, psk: &str, size: usize) -> Result<(), ProtocolParamError> {
    match STANDARD.decode(psk) {
        Ok(key) if key.len() == size => Ok(()),
        Ok(key) => Err(ProtocolParamError::invalid(
            protocol,
            "password",
            format!("{} needs a {}-byte key, got {} bytes", method, size, key.len()),
        )),
        Err(_) => Err(ProtocolParamError::invalid(
            protocol,
            "password",
            format!("{} needs a base64 encoded {}-byte key", method, size),
        )),
    }
}

pub struct HysteriaAdapter;

impl ProtocolAdapter for HysteriaAdapter {
    fn protocol(&self) -> &'static str {
        "hysteria"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["password"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["up_mbps", "down_mbps", "obfs", "sni", "allow_insecure", "alpn"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let password = require_str(p, raw, "password")?;
        let forced = TlsFeatures {
            forced: true,
            ..Default::default()
        };
        let tls = parse_tls(p, raw, forced)?
            .ok_or_else(|| ProtocolParamError::invalid(p, "tls", "hysteria requires TLS"))?;

        Ok(ProtocolParams::Hysteria(HysteriaParams {
            password: password.to_string(),
            up_mbps: opt_mbps(p, raw, "up_mbps")?.unwrap_or(100),
            down_mbps: opt_mbps(p, raw, "down_mbps")?.unwrap_or(100),
            obfs: opt_str(p, raw, "obfs")?.filter(|s| !s.is_empty()).map(str::to_string),
            tls,
        }))
    }
}

pub struct Hysteria2Adapter;

impl ProtocolAdapter for Hysteria2Adapter {
    fn protocol(&self) -> &'static str {
        "hysteria2"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["password"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["obfs_password", "up_mbps", "down_mbps", "sni", "allow_insecure", "alpn"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let password = require_str(p, raw, "password")?;
        let forced = TlsFeatures {
            forced: true,
            ..Default::default()
        };
        let tls = parse_tls(p, raw, forced)?
            .ok_or_else(|| ProtocolParamError::invalid(p, "tls", "hysteria2 requires TLS"))?;

        Ok(ProtocolParams::Hysteria2(Hysteria2Params {
            password: password.to_string(),
            obfs_password: opt_str(p, raw, "obfs_password")?
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            up_mbps: opt_mbps(p, raw, "up_mbps")?,
            down_mbps: opt_mbps(p, raw, "down_mbps")?,
            tls,
        }))
    }
}

pub struct TuicAdapter;

impl ProtocolAdapter for TuicAdapter {
    fn protocol(&self) -> &'static str {
        "tuic"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["uuid"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["password", "congestion_control", "udp_relay_mode", "sni", "allow_insecure", "alpn"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let uuid = require_uuid(p, raw)?;
        let password = opt_str(p, raw, "password")?.filter(|s| !s.is_empty()).unwrap_or(uuid);

        let congestion = opt_str(p, raw, "congestion_control")?.unwrap_or("cubic");
        one_of(p, "congestion_control", congestion, TUIC_CONGESTION)?;
        let relay = opt_str(p, raw, "udp_relay_mode")?.unwrap_or("native");
        one_of(p, "udp_relay_mode", relay, TUIC_RELAY_MODES)?;

        let forced = TlsFeatures {
            forced: true,
            ..Default::default()
        };
        let tls = parse_tls(p, raw, forced)?
            .ok_or_else(|| ProtocolParamError::invalid(p, "tls", "tuic requires TLS"))?;

        Ok(ProtocolParams::Tuic(TuicParams {
            uuid: uuid.to_string(),
            password: password.to_string(),
            congestion_control: congestion.to_string(),
            udp_relay_mode: relay.to_string(),
            tls,
        }))
    }
}

pub struct AnyTlsAdapter;

impl ProtocolAdapter for AnyTlsAdapter {
    fn protocol(&self) -> &'static str {
        "anytls"
    }

    fn required_params(&self) -> &'static [&'static str] {
        &["password"]
    }

    fn optional_params(&self) -> &'static [&'static str] {
        &["sni", "allow_insecure", "alpn"]
    }

    fn parse(&self, raw: &Map<String, Value>) -> Result<ProtocolParams, ProtocolParamError> {
        let p = self.protocol();
        let password = require_str(p, raw, "password")?;
        let forced = TlsFeatures {
            forced: true,
            ..Default::default()
        };
        let tls = parse_tls(p, raw, forced)?
            .ok_or_else(|| ProtocolParamError::invalid(p, "tls", "anytls requires TLS"))?;

        Ok(ProtocolParams::AnyTls(AnyTlsParams {
            password: password.to_string(),
            tls,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_vmess_rejects_malformed_uuid() {
        let err = VmessAdapter
            .validate_params(&raw(json!({"uuid": "not-a-uuid"})))
            .unwrap_err();
        assert_eq!(err.protocol, "vmess");
        assert_eq!(err.param, "uuid");

        assert!(VmessAdapter.validate_params(&raw(json!({"uuid": UUID}))).is_ok());
    }

    #[test]
    fn test_vmess_defaults() {
        let map = VmessAdapter.convert_params(&raw(json!({"uuid": UUID}))).unwrap();
        assert_eq!(map["security"], "auto");
        assert_eq!(map["alter_id"], 0);
        assert!(!map.contains_key("tls"));
    }

    #[test]
    fn test_vmess_alter_id_bounds() {
        let err = VmessAdapter
            .validate_params(&raw(json!({"uuid": UUID, "alter_id": 70000})))
            .unwrap_err();
        assert_eq!(err.param, "alter_id");

        let err = VmessAdapter
            .validate_params(&raw(json!({"uuid": UUID, "alter_id": "abc"})))
            .unwrap_err();
        assert_eq!(err.expected.as_deref(), Some("integer"));
    }

    #[test]
    fn test_vmess_security_enum() {
        let err = VmessAdapter
            .validate_params(&raw(json!({"uuid": UUID, "security": "rc4"})))
            .unwrap_err();
        assert_eq!(err.param, "security");
    }

    #[test]
    fn test_vless_forces_packet_encoding() {
        let map = VlessAdapter
            .convert_params(&raw(json!({"uuid": UUID, "packet_encoding": "packetaddr"})))
            .unwrap();
        assert_eq!(map["packet_encoding"], "xudp");
        assert_eq!(map["encryption"], "none");
    }

    #[test]
    fn test_vless_rejects_encryption_and_flow() {
        let err = VlessAdapter
            .validate_params(&raw(json!({"uuid": UUID, "encryption": "aes-128-gcm"})))
            .unwrap_err();
        assert_eq!(err.param, "encryption");

        let err = VlessAdapter
            .validate_params(&raw(json!({"uuid": UUID, "flow": "xtls-rprx-direct"})))
            .unwrap_err();
        assert_eq!(err.param, "flow");

        assert!(VlessAdapter
            .validate_params(&raw(json!({"uuid": UUID, "flow": "xtls-rprx-vision"})))
            .is_ok());
    }

    #[test]
    fn test_vless_reality_tls() {
        let params = VlessAdapter
            .parse(&raw(json!({
                "uuid": UUID,
                "flow": "xtls-rprx-vision",
                "tls": {"server_name": "www.microsoft.com", "reality": {"public_key": "pk", "short_id": "0123"}}
            })))
            .unwrap();
        let tls = params.tls().unwrap();
        assert_eq!(tls.server_name.as_deref(), Some("www.microsoft.com"));
        assert_eq!(tls.reality().unwrap().short_id, "0123");
    }

    #[test]
    fn test_trojan_always_enables_tls() {
        let map = TrojanAdapter
            .convert_params(&raw(json!({"password": "pw", "tls": false, "sni": "t.example.com"})))
            .unwrap();
        assert_eq!(map["tls"]["enabled"], true);
        assert_eq!(map["tls"]["server_name"], "t.example.com");

        let err = TrojanAdapter.validate_params(&raw(json!({}))).unwrap_err();
        assert_eq!(err.param, "password");
    }

    #[test]
    fn test_shadowsocks_method_allow_list() {
        let err = ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "rc4-md5", "password": "pw"})))
            .unwrap_err();
        assert_eq!(err.param, "method");

        assert!(ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "aes-128-gcm", "password": "pw"})))
            .is_ok());

        let err = ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "aes-128-gcm", "password": "pw", "plugin": "cloak"})))
            .unwrap_err();
        assert_eq!(err.param, "plugin");
    }

    #[test]
    fn test_shadowsocks_2022_key_length() {
        // 16 bytes
        let psk16 = "c2VydmVyLXBzay0xMjM0NQ==";
        assert!(ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "2022-blake3-aes-128-gcm", "password": psk16})))
            .is_ok());

        let err = ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "2022-blake3-aes-256-gcm", "password": psk16})))
            .unwrap_err();
        assert_eq!(err.param, "password");
        assert!(err.to_string().contains("32-byte"));

        let err = ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "2022-blake3-aes-128-gcm", "password": "pw"})))
            .unwrap_err();
        assert_eq!(err.param, "password");

        let generated = crate::crypto::generate_server_key("2022-blake3-chacha20-poly1305").unwrap();
        assert!(ShadowsocksAdapter
            .validate_params(&raw(json!({"method": "2022-blake3-chacha20-poly1305", "password": generated})))
            .is_ok());
    }

    #[test]
    fn test_tuic_defaults() {
        let params = TuicAdapter.parse(&raw(json!({"uuid": UUID}))).unwrap();
        match params {
            ProtocolParams::Tuic(p) => {
                assert_eq!(p.password, UUID);
                assert_eq!(p.congestion_control, "cubic");
                assert_eq!(p.udp_relay_mode, "native");
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_hysteria_bandwidth_defaults() {
        let params = HysteriaAdapter.parse(&raw(json!({"password": "pw", "up_mbps": "50"}))).unwrap();
        match params {
            ProtocolParams::Hysteria(p) => {
                assert_eq!(p.up_mbps, 50);
                assert_eq!(p.down_mbps, 100);
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_convert_output_contains_required_params() {
        let adapters: Vec<(Box<dyn ProtocolAdapter>, Value)> = vec![
            (Box::new(VmessAdapter), json!({"uuid": UUID})),
            (Box::new(VlessAdapter), json!({"uuid": UUID})),
            (Box::new(TrojanAdapter), json!({"password": "pw"})),
            (Box::new(ShadowsocksAdapter), json!({"method": "aes-256-gcm", "password": "pw"})),
            (Box::new(HysteriaAdapter), json!({"password": "pw"})),
            (Box::new(Hysteria2Adapter), json!({"password": "pw"})),
            (Box::new(TuicAdapter), json!({"uuid": UUID})),
            (Box::new(AnyTlsAdapter), json!({"password": "pw"})),
        ];
        for (adapter, input) in adapters {
            let input = raw(input);
            adapter.validate_params(&input).unwrap();
            let map = adapter.convert_params(&input).unwrap();
            for name in adapter.required_params() {
                assert!(map.contains_key(*name), "{} missing {}", adapter.protocol(), name);
            }
            let typed = ProtocolParams::from_canonical(adapter.protocol(), &map).unwrap();
            assert_eq!(typed.protocol(), adapter.protocol());
        }
    }
}
