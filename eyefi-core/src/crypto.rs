// SPDX-License-Identifier: MIT
//
// SceyeFi: Eye-Fi Card Upload Server

//! Challenge-response primitives: nonces and MD5 credentials
//!
//! Both credential forms are MD5 over a plain concatenation; only the order
//! of the inputs differs:
//! - server to card: `MD5(mac || cnonce || upload_key)`
//! - card to server: `MD5(mac || upload_key || snonce)`

use crate::{Error, Result};
use md5::{Digest, Md5};
use std::fmt;

/// Nonce length in bytes
pub const NONCE_LEN: usize = 16;

/// Credential length in bytes
pub const CREDENTIAL_LEN: usize = 16;

/// 16 random bytes exchanged during StartSession
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Generate a random nonce
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a hex-encoded nonce
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = decode_hex(s)?;
        let bytes: [u8; NONCE_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            Error::Protocol(format!("Nonce must be {} bytes, got {}", NONCE_LEN, v.len()))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        encode_hex(&self.0)
    }
}

impl fmt::Debug for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nonce({})", self.to_hex())
    }
}

/// MD5 digest over the concatenation of `parts`
pub fn md5_concat(parts: &[&[u8]]) -> [u8; CREDENTIAL_LEN] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Credential the server returns from StartSession
pub fn server_credential(mac: &[u8], cnonce: &Nonce, upload_key: &[u8]) -> [u8; CREDENTIAL_LEN] {
    md5_concat(&[mac, cnonce.as_bytes(), upload_key])
}

/// Credential a card presents on later calls
pub fn card_credential(mac: &[u8], upload_key: &[u8], snonce: &Nonce) -> [u8; CREDENTIAL_LEN] {
    md5_concat(&[mac, upload_key, snonce.as_bytes()])
}

/// Encode bytes to lowercase hexadecimal
pub fn encode_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Decode hexadecimal (either case), tolerating surrounding whitespace
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(s.trim())?)
}
