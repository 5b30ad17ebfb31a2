//! Session token issuance.
//!
//! A token is the hex MD5 of a fresh 128-character random string, truncated to
//! the length the security level asks for. The same bytes serve as the AES key
//! of the connection and as the credential for opening transmission channels.

use md5::{Digest, Md5};
use rand::distr::Alphanumeric;
use rand::Rng;

/// Length of the random material fed to the hash.
const RANDOM_MATERIAL_LEN: usize = 128;

/// Token strength selected at server start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityLevel {
    /// 16-byte token, AES-128
    Standard,
    /// 24-byte token, AES-192
    High,
    /// 32-byte token, AES-256
    Maximum,
}

impl SecurityLevel {
    /// Map a configured level: <=1 standard, 2 high, >=3 maximum.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 | 1 => SecurityLevel::Standard,
            2 => SecurityLevel::High,
            _ => SecurityLevel::Maximum,
        }
    }

    pub fn token_len(self) -> usize {
        match self {
            SecurityLevel::Standard => 16,
            SecurityLevel::High => 24,
            SecurityLevel::Maximum => 32,
        }
    }
}

/// Per-session secret bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Vec<u8>);

impl Token {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Token(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Token({} bytes)", self.0.len())
    }
}

/// Generate a token for `level`. The thread RNG is reseeded from the OS, so
/// two tokens issued back to back do not collide in practice.
pub fn generate_token(level: SecurityLevel) -> Token {
    let material: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_MATERIAL_LEN)
        .map(char::from)
        .collect();

    let digest_hex = hex::encode(Md5::digest(material.as_bytes()));
    Token(digest_hex.as_bytes()[..level.token_len()].to_vec())
}
