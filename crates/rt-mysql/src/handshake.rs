//! `HandshakeV10` decoding and the two auth plugins this client speaks:
//! `mysql_native_password` and `caching_sha2_password` (including its
//! RSA-OAEP full-auth fallback).

use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha1::{Digest as Sha1Digest, Sha1};
use sha2::Sha256;

use crate::error::MySqlError;
use crate::value::Reader;

pub const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
pub const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
pub const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
pub const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
pub const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
pub const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
pub const CLIENT_DEPRECATE_EOF: u32 = 0x0100_0000;

pub fn client_capabilities(with_database: bool) -> u32 {
    let mut caps = CLIENT_LONG_PASSWORD
        | CLIENT_PROTOCOL_41
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH
        | CLIENT_MULTI_RESULTS
        | CLIENT_DEPRECATE_EOF;
    if with_database {
        caps |= CLIENT_CONNECT_WITH_DB;
    }
    caps
}

#[derive(Debug, Clone)]
pub struct HandshakeV10 {
    pub protocol_version: u8,
    pub server_version: String,
    pub connection_id: u32,
    pub auth_plugin_data: Vec<u8>,
    pub capabilities: u32,
    pub auth_plugin_name: String,
}

impl HandshakeV10 {
    pub fn parse(payload: &[u8]) -> Result<Self, MySqlError> {
        let mut r = Reader::new(payload);
        let protocol_version = r.read_u8()?;
        if protocol_version != 10 {
            return Err(MySqlError::Protocol(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        let server_version = String::from_utf8_lossy(r.read_null_terminated()?).into_owned();
        let connection_id = r.read_u32_le()?;
        let mut auth_data = r.take(8)?.to_vec();
        let _filler = r.read_u8()?;
        let caps_low = r.read_u16_le()? as u32;
        let mut capabilities = caps_low;
        let mut auth_plugin_name = String::new();
        if r.remaining() > 0 {
            let _charset = r.read_u8()?;
            let _status_flags = r.read_u16_le()?;
            let caps_high = r.read_u16_le()? as u32;
            capabilities |= caps_high << 16;
            let auth_data_len = r.read_u8()?;
            let _reserved = r.take(10)?;
            if capabilities & CLIENT_SECURE_CONNECTION != 0 {
                let len2 = std::cmp::max(13, auth_data_len as usize - 8);
                let rest = r.take(len2)?;
                auth_data.extend_from_slice(&rest[..rest.len().saturating_sub(1)]);
            }
            if capabilities & CLIENT_PLUGIN_AUTH != 0 {
                let name = r.read_null_terminated().unwrap_or(&[]);
                auth_plugin_name = String::from_utf8_lossy(name).into_owned();
            }
        }
        Ok(HandshakeV10 {
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data: auth_data,
            capabilities,
            auth_plugin_name,
        })
    }
}

/// `mysql_native_password`: `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`.
pub fn scramble_native(password: &[u8], seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha1::digest(password);
    let stage2 = Sha1::digest(stage1);
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let mixed = hasher.finalize();
    xor_bytes(&stage1, &mixed)
}

/// `caching_sha2_password` fast-auth response, same construction over SHA256.
pub fn scramble_caching_sha2(password: &[u8], seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let stage1 = Sha256::digest(password);
    let stage2 = Sha256::digest(stage1);
    let mut hasher = Sha256::new();
    hasher.update(seed);
    hasher.update(stage2);
    let mixed = hasher.finalize();
    xor_bytes(&stage1, &mixed)
}

fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

/// Full-auth path: password XORed against the cyclically-repeated seed,
/// null-padded, then RSA-OAEP(SHA1) encrypted with the server's public key.
/// `pem` is what the server sent back for a public-key request (or what was
/// configured out of band).
pub fn encrypt_full_auth_password(
    password: &[u8],
    seed: &[u8],
    pem: &str,
) -> Result<Vec<u8>, MySqlError> {
    let public_key = parse_rsa_public_key(pem)?;
    let mut padded: Vec<u8> = password.to_vec();
    padded.push(0);
    let xored: Vec<u8> = padded
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ seed[i % seed.len()])
        .collect();
    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Oaep::new::<sha1::Sha1>(), &xored)
        .map_err(|e| MySqlError::Auth(format!("RSA encryption failed: {e}")))
}

fn parse_rsa_public_key(pem: &str) -> Result<RsaPublicKey, MySqlError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| MySqlError::Auth(format!("invalid RSA public key: {e}")))
}

/// Trims the handshake's 20-byte `auth_plugin_data` (minus its trailing NUL)
/// down to the 20 bytes both auth plugins scramble against.
pub fn auth_seed(handshake: &HandshakeV10) -> &[u8] {
    let data = &handshake.auth_plugin_data;
    if data.len() > 20 {
        &data[..20]
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_password_scrambles_to_empty() {
        assert!(scramble_native(b"", b"01234567890123456789").is_empty());
        assert!(scramble_caching_sha2(b"", b"01234567890123456789").is_empty());
    }

    #[test]
    fn native_scramble_is_deterministic_and_seed_sensitive() {
        let seed = b"01234567890123456789";
        let a = scramble_native(b"hunter2", seed);
        let b = scramble_native(b"hunter2", seed);
        assert_eq!(a, b);
        assert_eq!(a.len(), 20);
        let c = scramble_native(b"hunter2", b"98765432109876543210");
        assert_ne!(a, c);
    }

    #[test]
    fn caching_sha2_scramble_is_32_bytes() {
        let seed = b"01234567890123456789";
        let scrambled = scramble_caching_sha2(b"hunter2", seed);
        assert_eq!(scrambled.len(), 32);
    }
}
