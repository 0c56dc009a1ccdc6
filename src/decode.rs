//! Rule source decoding chain.
//!
//! Rules may be distributed in obfuscated form. [`decode_source`] tries each
//! stage in order and stops at the first whose output looks like rule
//! source:
//!
//! 1. plain text
//! 2. base64-wrapped gzip
//! 3. base64
//! 4. base64 of `nonce(12) || AES-256-GCM ciphertext`
//! 5. base64 of `sender_public_key(32) || nonce(24) || crypto_box ciphertext`
//!
//! Stages 4 and 5 only run when the corresponding key is configured.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use crypto_box::{PublicKey, SalsaBox, SecretKey};
use flate2::read::GzDecoder;
use regex::Regex;
use std::io::Read;
use std::sync::OnceLock;

use crate::config::DecodeConfig;

/// Which stage of the chain produced the plain source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    Plain,
    Gzip,
    Base64,
    Symmetric,
    Asymmetric,
}

/// Decode a base64 32-byte key from configuration.
pub fn decode_key(key: &str) -> Result<[u8; 32]> {
    let bytes = STANDARD
        .decode(key.trim().as_bytes())
        .context("key is not valid base64")?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("key must be 32 bytes, got {}", len))
}

fn rule_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\brule\s*=").expect("static regex"))
}

/// Heuristic: the text assigns a `rule` table somewhere.
pub fn looks_like_rule(text: &str) -> bool {
    rule_pattern().is_match(text)
}

pub fn decode_source(text: &str, keys: &DecodeConfig) -> Result<(String, DecodeStage)> {
    if looks_like_rule(text) {
        return Ok((text.to_string(), DecodeStage::Plain));
    }

    let compact: String = text.split_whitespace().collect();
    let Ok(raw) = STANDARD.decode(compact.as_bytes()) else {
        bail!("source is neither rule text nor base64");
    };

    let stages: [(DecodeStage, Option<Result<Vec<u8>>>); 4] = [
        (DecodeStage::Gzip, Some(gunzip(&raw))),
        (DecodeStage::Base64, Some(Ok(raw.clone()))),
        (
            DecodeStage::Symmetric,
            keys.aes_key.as_deref().map(|k| aes_decrypt(&raw, k)),
        ),
        (
            DecodeStage::Asymmetric,
            keys.box_secret_key.as_deref().map(|k| box_decrypt(&raw, k)),
        ),
    ];

    for (stage, output) in stages {
        let Some(Ok(bytes)) = output else {
            continue;
        };
        if let Ok(text) = String::from_utf8(bytes) {
            if looks_like_rule(&text) {
                return Ok((text, stage));
            }
        }
    }

    bail!("no decoding stage produced rule source")
}

fn gunzip(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    GzDecoder::new(raw)
        .read_to_end(&mut out)
        .context("gzip decode failed")?;
    Ok(out)
}

fn aes_decrypt(raw: &[u8], key: &str) -> Result<Vec<u8>> {
    if raw.len() <= 12 {
        bail!("ciphertext too short");
    }
    let key = decode_key(key)?;
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| anyhow::anyhow!("aes key: {}", e))?;
    let (nonce, ciphertext) = raw.split_at(12);
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow::anyhow!("aes-gcm decrypt failed: {}", e))
}

fn box_decrypt(raw: &[u8], key: &str) -> Result<Vec<u8>> {
    if raw.len() <= 32 + 24 {
        bail!("ciphertext too short");
    }
    let secret = SecretKey::from(decode_key(key)?);
    let (sender, rest) = raw.split_at(32);
    let (nonce, ciphertext) = rest.split_at(24);
    let sender: [u8; 32] = sender
        .try_into()
        .map_err(|_| anyhow::anyhow!("bad sender key"))?;
    let salsa = SalsaBox::new(&PublicKey::from(sender), &secret);
    salsa
        .decrypt(crypto_box::Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow::anyhow!("crypto_box decrypt failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const RULE: &str = "rule = { title = \"demo\" }";

    #[test]
    fn test_plain_passthrough() {
        let (text, stage) = decode_source(RULE, &DecodeConfig::default()).unwrap();
        assert_eq!(text, RULE);
        assert_eq!(stage, DecodeStage::Plain);
    }

    #[test]
    fn test_base64() {
        let encoded = STANDARD.encode(RULE);
        let (text, stage) = decode_source(&encoded, &DecodeConfig::default()).unwrap();
        assert_eq!(text, RULE);
        assert_eq!(stage, DecodeStage::Base64);
    }

    #[test]
    fn test_gzip() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(RULE.as_bytes()).unwrap();
        let encoded = STANDARD.encode(enc.finish().unwrap());
        let (text, stage) = decode_source(&encoded, &DecodeConfig::default()).unwrap();
        assert_eq!(text, RULE);
        assert_eq!(stage, DecodeStage::Gzip);
    }

    #[test]
    fn test_aes_gcm() {
        let key = [7u8; 32];
        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
        let nonce = [1u8; 12];
        let mut payload = nonce.to_vec();
        payload.extend(cipher.encrypt(Nonce::from_slice(&nonce), RULE.as_bytes()).unwrap());
        let keys = DecodeConfig {
            aes_key: Some(STANDARD.encode(key)),
            box_secret_key: None,
        };
        let (text, stage) = decode_source(&STANDARD.encode(payload), &keys).unwrap();
        assert_eq!(text, RULE);
        assert_eq!(stage, DecodeStage::Symmetric);
    }

    #[test]
    fn test_crypto_box() {
        let sender = SecretKey::from([3u8; 32]);
        let recipient = SecretKey::from([9u8; 32]);
        let nonce = [5u8; 24];
        let salsa = SalsaBox::new(&recipient.public_key(), &sender);
        let ct = salsa
            .encrypt(crypto_box::Nonce::from_slice(&nonce), RULE.as_bytes())
            .unwrap();
        let mut payload = sender.public_key().as_bytes().to_vec();
        payload.extend_from_slice(&nonce);
        payload.extend(ct);
        let keys = DecodeConfig {
            aes_key: None,
            box_secret_key: Some(STANDARD.encode([9u8; 32])),
        };
        let (text, stage) = decode_source(&STANDARD.encode(payload), &keys).unwrap();
        assert_eq!(text, RULE);
        assert_eq!(stage, DecodeStage::Asymmetric);
    }

    #[test]
    fn test_garbage_fails() {
        assert!(decode_source("%%% not a rule %%%", &DecodeConfig::default()).is_err());
        let encoded = STANDARD.encode("just some text");
        assert!(decode_source(&encoded, &DecodeConfig::default()).is_err());
    }

    #[test]
    fn test_decode_key_length() {
        assert!(decode_key(&STANDARD.encode([0u8; 32])).is_ok());
        assert!(decode_key(&STANDARD.encode([0u8; 16])).is_err());
    }
}
