//! AES in CFB mode with a fixed IV, keyed by the connection token.
//!
//! CFB turns the block cipher into a byte stream cipher: the ciphertext has
//! the plaintext's length and carries no terminator, so decoding needs the
//! plaintext length up front.

use aes::{Aes128, Aes192, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, InvalidLength, KeyIvInit};

use crate::error::CipherError;

/// Process-wide initialization vector shared by both peers.
pub const COMMON_IV: [u8; 16] = [
    0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f,
];

type Aes128CfbEnc = cfb_mode::Encryptor<Aes128>;
type Aes192CfbEnc = cfb_mode::Encryptor<Aes192>;
type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes128CfbDec = cfb_mode::Decryptor<Aes128>;
type Aes192CfbDec = cfb_mode::Decryptor<Aes192>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

/// Fail with `InvalidKeyLength` unless the key selects AES-128/192/256.
pub fn check_key(key: &[u8]) -> Result<(), CipherError> {
    match key.len() {
        16 | 24 | 32 => Ok(()),
        n => Err(CipherError::InvalidKeyLength(n)),
    }
}

/// Encrypt `plaintext` under `key`.
pub fn encode(plaintext: &[u8], key: &[u8]) -> Result<Vec<u8>, CipherError> {
    let mut buf = plaintext.to_vec();
    let invalid = |_: InvalidLength| CipherError::InvalidKeyLength(key.len());
    match key.len() {
        16 => Aes128CfbEnc::new_from_slices(key, &COMMON_IV).map_err(invalid)?.encrypt(&mut buf),
        24 => Aes192CfbEnc::new_from_slices(key, &COMMON_IV).map_err(invalid)?.encrypt(&mut buf),
        32 => Aes256CfbEnc::new_from_slices(key, &COMMON_IV).map_err(invalid)?.encrypt(&mut buf),
        n => return Err(CipherError::InvalidKeyLength(n)),
    }
    Ok(buf)
}

/// Decrypt `ciphertext` under `key`, returning exactly `plain_len` bytes.
/// Trailing ciphertext past `plain_len` is ignored.
pub fn decode(ciphertext: &[u8], plain_len: usize, key: &[u8]) -> Result<Vec<u8>, CipherError> {
    check_key(key)?;
    if ciphertext.len() < plain_len {
        return Err(CipherError::Truncated {
            expected: plain_len,
            actual: ciphertext.len(),
        });
    }

    let mut buf = ciphertext[..plain_len].to_vec();
    let invalid = |_: InvalidLength| CipherError::InvalidKeyLength(key.len());
    match key.len() {
        16 => Aes128CfbDec::new_from_slices(key, &COMMON_IV).map_err(invalid)?.decrypt(&mut buf),
        24 => Aes192CfbDec::new_from_slices(key, &COMMON_IV).map_err(invalid)?.decrypt(&mut buf),
        32 => Aes256CfbDec::new_from_slices(key, &COMMON_IV).map_err(invalid)?.decrypt(&mut buf),
        n => return Err(CipherError::InvalidKeyLength(n)),
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_16: &[u8] = b"0123456789abcdef";
    const KEY_24: &[u8] = b"0123456789abcdef01234567";
    const KEY_32: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[test]
    fn test_roundtrip_all_key_sizes() {
        // Lengths straddle the 16-byte block boundary
        let plaintext = b"user and password material, 37 bytes";
        for key in [KEY_16, KEY_24, KEY_32] {
            let ciphertext = encode(plaintext, key).unwrap();
            assert_eq!(ciphertext.len(), plaintext.len());
            assert_ne!(&ciphertext[..], &plaintext[..]);
            assert_eq!(decode(&ciphertext, plaintext.len(), key).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_empty_plaintext() {
        let ciphertext = encode(b"", KEY_16).unwrap();
        assert!(ciphertext.is_empty());
        assert!(decode(&ciphertext, 0, KEY_16).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_key_length() {
        assert_eq!(encode(b"data", b"short"), Err(CipherError::InvalidKeyLength(5)));
        assert_eq!(decode(b"data", 4, &[0u8; 20]), Err(CipherError::InvalidKeyLength(20)));
    }

    #[test]
    fn test_decode_truncated_ciphertext() {
        let ciphertext = encode(b"userpass", KEY_16).unwrap();
        assert_eq!(
            decode(&ciphertext, 12, KEY_16),
            Err(CipherError::Truncated { expected: 12, actual: 8 })
        );
    }

    #[test]
    fn test_decode_prefix_of_longer_ciphertext() {
        let ciphertext = encode(b"userpass-and-padding", KEY_16).unwrap();
        assert_eq!(decode(&ciphertext, 8, KEY_16).unwrap(), b"userpass");
    }

    #[test]
    fn test_wrong_key_does_not_recover_plaintext() {
        let ciphertext = encode(b"userpass", KEY_16).unwrap();
        let other = b"fedcba9876543210";
        assert_ne!(decode(&ciphertext, 8, other).unwrap(), b"userpass");
    }
}
