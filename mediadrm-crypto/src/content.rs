//! Content crypto exposed through crypto sessions.
//!
//! `AES/CBC/NoPadding` with AES-128 and `HmacSHA256`. Inputs to the block
//! cipher must already be a multiple of the block size.

use crate::error::{CryptoError, CryptoResult};
use crate::key::ContentKey;
use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

type HmacSha256 = Hmac<Sha256>;

/// Block cipher algorithms a crypto session can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherAlgorithm {
    AesCbcNoPadding,
}

impl CipherAlgorithm {
    /// Parses a transformation name such as `AES/CBC/NoPadding`.
    pub fn parse(name: &str) -> CryptoResult<Self> {
        match name {
            "AES/CBC/NoPadding" => Ok(Self::AesCbcNoPadding),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Returns the transformation name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AesCbcNoPadding => "AES/CBC/NoPadding",
        }
    }
}

impl fmt::Display for CipherAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MAC algorithms a crypto session can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MacAlgorithm {
    HmacSha256,
}

impl MacAlgorithm {
    /// Parses a MAC name such as `HmacSHA256`.
    pub fn parse(name: &str) -> CryptoResult<Self> {
        match name {
            "HmacSHA256" => Ok(Self::HmacSha256),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    /// Returns the algorithm name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HmacSha256 => "HmacSHA256",
        }
    }
}

impl fmt::Display for MacAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn check_block_input(input: &[u8], iv: &[u8]) -> CryptoResult<[u8; AES_BLOCK_SIZE]> {
    let iv: [u8; AES_BLOCK_SIZE] = iv.try_into().map_err(|_| CryptoError::InvalidIvLength {
        expected: AES_BLOCK_SIZE,
        actual: iv.len(),
    })?;
    if !input.len().is_multiple_of(AES_BLOCK_SIZE) {
        return Err(CryptoError::Encryption(format!(
            "input length {} is not aligned to AES block size {}",
            input.len(),
            AES_BLOCK_SIZE
        )));
    }
    Ok(iv)
}

/// Encrypts block-aligned input with AES-128-CBC and no padding.
pub fn aes_cbc_encrypt(key: &ContentKey, input: &[u8], iv: &[u8]) -> CryptoResult<Vec<u8>> {
    let iv = check_block_input(input, iv)?;
    let mut buf = input.to_vec();
    let len = buf.len();
    let encryptor = cbc::Encryptor::<Aes128>::new(key.as_bytes().into(), (&iv).into());
    encryptor
        .encrypt_padded_mut::<NoPadding>(&mut buf, len)
        .map_err(|e| CryptoError::Encryption(format!("cbc encrypt failed: {e}")))?;
    Ok(buf)
}

/// Decrypts block-aligned input with AES-128-CBC and no padding.
pub fn aes_cbc_decrypt(key: &ContentKey, input: &[u8], iv: &[u8]) -> CryptoResult<Vec<u8>> {
    let iv = check_block_input(input, iv)
        .map_err(|e| match e {
            CryptoError::Encryption(msg) => CryptoError::Decryption(msg),
            other => other,
        })?;
    let mut buf = input.to_vec();
    let decryptor = cbc::Decryptor::<Aes128>::new(key.as_bytes().into(), (&iv).into());
    let written = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|e| CryptoError::Decryption(format!("cbc decrypt failed: {e}")))?
        .len();
    buf.truncate(written);
    Ok(buf)
}

/// Computes an HMAC-SHA256 tag over `message`.
pub fn hmac_sign(key: &ContentKey, message: &[u8]) -> CryptoResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encryption(format!("hmac init failed: {e}")))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verifies an HMAC-SHA256 tag in constant time.
pub fn hmac_verify(key: &ContentKey, message: &[u8], signature: &[u8]) -> CryptoResult<bool> {
    let mut mac = HmacSha256::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::Encryption(format!("hmac init failed: {e}")))?;
    mac.update(message);
    Ok(mac.verify_slice(signature).is_ok())
}
