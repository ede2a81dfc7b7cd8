use mediadrm_crypto::content::{
    aes_cbc_decrypt, aes_cbc_encrypt, hmac_sign, hmac_verify, AES_BLOCK_SIZE,
};
use mediadrm_crypto::{CipherAlgorithm, ContentKey, CryptoError, MacAlgorithm};

fn nist_key() -> ContentKey {
    ContentKey::from_slice(&hex::decode("2b7e151628aed2a6abf7158809cf4f3c").unwrap()).unwrap()
}

fn nist_iv() -> Vec<u8> {
    hex::decode("000102030405060708090a0b0c0d0e0f").unwrap()
}

// ── AES/CBC/NoPadding ────────────────────────────────────────────

#[test]
fn aes_cbc_matches_known_answer() {
    let plaintext = hex::decode("6bc1bee22e409f96e93d7e117393172a").unwrap();
    let ciphertext = aes_cbc_encrypt(&nist_key(), &plaintext, &nist_iv()).unwrap();
    assert_eq!(hex::encode(&ciphertext), "7649abac8119b246cee98e9b12e9197d");
}

#[test]
fn aes_cbc_roundtrip_multiple_blocks() {
    let key = ContentKey::random();
    let iv = [9u8; AES_BLOCK_SIZE];
    let plaintext: Vec<u8> = (0..64).map(|i| i as u8).collect();
    let ciphertext = aes_cbc_encrypt(&key, &plaintext, &iv).unwrap();
    assert_eq!(ciphertext.len(), plaintext.len());
    assert_ne!(ciphertext, plaintext);
    assert_eq!(aes_cbc_decrypt(&key, &ciphertext, &iv).unwrap(), plaintext);
}

#[test]
fn aes_cbc_rejects_unaligned_input() {
    let key = ContentKey::random();
    let err = aes_cbc_encrypt(&key, &[0u8; 15], &[0u8; 16]).unwrap_err();
    assert!(matches!(err, CryptoError::Encryption(_)));
    let err = aes_cbc_decrypt(&key, &[0u8; 17], &[0u8; 16]).unwrap_err();
    assert!(matches!(err, CryptoError::Decryption(_)));
}

#[test]
fn aes_cbc_rejects_bad_iv_length() {
    let key = ContentKey::random();
    let err = aes_cbc_encrypt(&key, &[0u8; 16], &[0u8; 8]).unwrap_err();
    assert!(matches!(
        err,
        CryptoError::InvalidIvLength {
            expected: 16,
            actual: 8
        }
    ));
}

#[test]
fn aes_cbc_empty_input_is_empty_output() {
    let key = ContentKey::random();
    assert!(aes_cbc_encrypt(&key, &[], &[0u8; 16]).unwrap().is_empty());
}

// ── HmacSHA256 ───────────────────────────────────────────────────

#[test]
fn hmac_sign_then_verify() {
    let key = ContentKey::random();
    let tag = hmac_sign(&key, b"segment").unwrap();
    assert_eq!(tag.len(), 32);
    assert!(hmac_verify(&key, b"segment", &tag).unwrap());
}

#[test]
fn hmac_verify_rejects_other_message_or_key() {
    let key = ContentKey::random();
    let tag = hmac_sign(&key, b"segment").unwrap();
    assert!(!hmac_verify(&key, b"segment!", &tag).unwrap());
    assert!(!hmac_verify(&ContentKey::random(), b"segment", &tag).unwrap());
    assert!(!hmac_verify(&key, b"segment", &tag[..16]).unwrap());
}

// ── Algorithm names ──────────────────────────────────────────────

#[test]
fn algorithm_names_parse() {
    assert_eq!(
        CipherAlgorithm::parse("AES/CBC/NoPadding").unwrap(),
        CipherAlgorithm::AesCbcNoPadding
    );
    assert_eq!(MacAlgorithm::parse("HmacSHA256").unwrap(), MacAlgorithm::HmacSha256);
    assert_eq!(CipherAlgorithm::AesCbcNoPadding.to_string(), "AES/CBC/NoPadding");
}

#[test]
fn unknown_algorithm_names_fail() {
    assert!(matches!(
        CipherAlgorithm::parse("AES/CTR/NoPadding"),
        Err(CryptoError::UnsupportedAlgorithm(_))
    ));
    assert!(MacAlgorithm::parse("hmacsha256").is_err());
}
