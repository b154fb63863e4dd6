//! Shadowsocks 2022 (AEAD-2022) key handling.
//!
//! Multi-user AEAD-2022 servers authenticate with `server_psk:user_psk`. The
//! server PSK is part of the node parameters; the user PSK is derived from the
//! user's uuid so it never needs to be stored.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::protocol::is_ss2022;

const USER_KEY_SEED: &str = "nodeplane-ss2022-user-key-";

/// PSK length in bytes for an AEAD-2022 method.
pub fn key_size(method: &str) -> Option<usize> {
    match method {
        "2022-blake3-aes-128-gcm" => Some(16),
        "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305" => Some(32),
        _ => None,
    }
}

/// Deterministic per-user PSK, base64 encoded.
pub fn derive_user_key(method: &str, uuid: &str) -> Option<String> {
    let size = key_size(method)?;
    let mut hasher = Sha256::new();
    hasher.update(USER_KEY_SEED.as_bytes());
    hasher.update(uuid.replace('-', "").as_bytes());
    let digest = hasher.finalize();
    Some(STANDARD.encode(&digest[..size]))
}

/// Fresh random server PSK for a new node.
pub fn generate_server_key(method: &str) -> Option<String> {
    let size = key_size(method)?;
    let mut key = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut key);
    Some(STANDARD.encode(key))
}

/// Secret pushed to the node agent as the user's uPSK.
pub fn agent_secret(method: &str, uuid: &str) -> String {
    derive_user_key(method, uuid).unwrap_or_else(|| uuid.to_string())
}

/// Password a client uses to connect.
pub fn client_password(method: &str, server_psk: &str, uuid: &str) -> String {
    match derive_user_key(method, uuid) {
        Some(user_key) if is_ss2022(method) => format!("{}:{}", server_psk, user_key),
        _ => uuid.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UUID: &str = "b831381d-6324-4d53-ad4f-8cda48b30811";

    #[test]
    fn test_key_sizes() {
        let key = derive_user_key("2022-blake3-aes-128-gcm", UUID).unwrap();
        assert_eq!(STANDARD.decode(key).unwrap().len(), 16);
        let key = derive_user_key("2022-blake3-chacha20-poly1305", UUID).unwrap();
        assert_eq!(STANDARD.decode(key).unwrap().len(), 32);
        assert!(derive_user_key("aes-256-gcm", UUID).is_none());
    }

    #[test]
    fn test_user_key_is_stable_and_dash_insensitive() {
        let a = derive_user_key("2022-blake3-aes-256-gcm", UUID).unwrap();
        let b = derive_user_key("2022-blake3-aes-256-gcm", &UUID.replace('-', "")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_client_password() {
        let pw = client_password("2022-blake3-aes-128-gcm", "c2VydmVy", UUID);
        let (server, user) = pw.split_once(':').unwrap();
        assert_eq!(server, "c2VydmVy");
        assert_eq!(user, agent_secret("2022-blake3-aes-128-gcm", UUID));

        assert_eq!(client_password("aes-128-gcm", "ignored", UUID), UUID);
        assert_eq!(agent_secret("aes-128-gcm", UUID), UUID);
    }

    #[test]
    fn test_generate_server_key() {
        let key = generate_server_key("2022-blake3-aes-256-gcm").unwrap();
        assert_eq!(STANDARD.decode(key).unwrap().len(), 32);
        assert!(generate_server_key("chacha20-ietf-poly1305").is_none());
    }
}
