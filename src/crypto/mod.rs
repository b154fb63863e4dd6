//! Key derivation for credential-bearing protocols.

pub mod ss2022;

pub use ss2022::{agent_secret, client_password, generate_server_key};
