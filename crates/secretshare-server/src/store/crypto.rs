use std::collections::BTreeMap;
use std::fmt;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::ZeroizeOnDrop;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

const SELF_TEST_PROBE: &str = "This is a test secret for validation";
const LEGACY_PREVIEW_CHARS: usize = 20;

/// 32-byte ChaCha20Poly1305 key.
#[derive(ZeroizeOnDrop)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Wrap raw key bytes. Returns `None` unless exactly 32 bytes are given.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let key: [u8; KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(key))
    }

    /// Parse a key encoded as 64 hex characters or 44 base64 characters.
    pub fn parse(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        let bytes = match encoded.len() {
            64 => hex::decode(encoded).context("encryption key is not valid hex")?,
            44 => STANDARD
                .decode(encoded)
                .context("encryption key is not valid base64")?,
            n => anyhow::bail!(
                "encryption key must be 32 bytes (64 hex or 44 base64 chars), got {n} chars"
            ),
        };
        Self::from_bytes(&bytes).context("encryption key must decode to 32 bytes")
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(..)")
    }
}

/// Versioned set of keys. New envelopes always use the primary key; retired
/// keys are kept only so older envelopes stay readable.
#[derive(Debug)]
pub struct Keyring {
    primary: u8,
    keys: BTreeMap<u8, EncryptionKey>,
}

impl Keyring {
    pub fn new(version: u8, key: EncryptionKey) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(version, key);
        Self {
            primary: version,
            keys,
        }
    }

    /// Add a decrypt-only key. Fails if `version` is already taken.
    pub fn with_retired(mut self, version: u8, key: EncryptionKey) -> Result<Self> {
        if self.keys.contains_key(&version) {
            anyhow::bail!("key version {version} is configured twice");
        }
        self.keys.insert(version, key);
        Ok(self)
    }

    pub fn primary_version(&self) -> u8 {
        self.primary
    }

    fn primary(&self) -> &EncryptionKey {
        &self.keys[&self.primary]
    }

    fn get(&self, version: u8) -> Option<&EncryptionKey> {
        self.keys.get(&version)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("encryption failed")]
    Encryption,
    #[error("no key configured for version {0}")]
    UnknownKey(u8),
    #[error("malformed ciphertext envelope: {0}")]
    Malformed(&'static str),
    #[error("authentication tag did not verify")]
    TagMismatch,
    #[error("decrypted value is not valid UTF-8")]
    Utf8,
}

/// The at-rest ciphertext format: hex ciphertext, nonce and tag plus the
/// version of the key that sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_key_version")]
    pub kv: u8,
    pub encrypted: String,
    pub iv: String,
    pub tag: String,
}

fn default_key_version() -> u8 {
    1
}

/// What a stored `ciphertext` column turned out to contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredCiphertext {
    Envelope(Envelope),
    /// Written before encryption at rest existed; returned as-is.
    LegacyPlaintext(String),
}

impl StoredCiphertext {
    pub fn parse(stored: &str) -> Self {
        match serde_json::from_str::<Envelope>(stored) {
            Ok(envelope) => Self::Envelope(envelope),
            Err(_) => Self::LegacyPlaintext(stored.to_owned()),
        }
    }
}

/// Encrypts secret text for storage and opens it again.
#[derive(Debug)]
pub struct Codec {
    keys: Keyring,
}

impl Codec {
    /// Build a codec and run the round-trip self-test. A failed self-test is
    /// logged, not fatal.
    pub fn new(keys: Keyring) -> Self {
        let codec = Self { keys };
        if codec.self_test() {
            info!(
                key_version = codec.keys.primary_version(),
                "encryption self-test passed"
            );
        } else {
            error!("encryption self-test failed; check the configured encryption key");
        }
        codec
    }

    /// Codec with a random key that lives only as long as this process.
    pub fn ephemeral() -> Self {
        warn!(
            "no encryption key configured; using a generated key. Every stored secret \
             becomes unreadable when the process restarts. Set SECRETSHARE_ENCRYPTION_KEY \
             (see `secretshare keygen`) for any real deployment"
        );
        Self::new(Keyring::new(1, EncryptionKey::generate()))
    }

    pub fn primary_version(&self) -> u8 {
        self.keys.primary_version()
    }

    /// Seal `plaintext` under the primary key with a fresh nonce and return
    /// the serialized envelope.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CodecError> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(self.keys.primary().as_bytes()));

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let mut sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CodecError::Encryption)?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        let envelope = Envelope {
            kv: self.keys.primary_version(),
            encrypted: hex::encode(&sealed),
            iv: hex::encode(nonce_bytes),
            tag: hex::encode(tag),
        };
        serde_json::to_string(&envelope).map_err(|_| CodecError::Encryption)
    }

    /// Open a stored value. Legacy plaintext passes through unchanged.
    pub fn decrypt(&self, stored: &str) -> Result<String, CodecError> {
        match StoredCiphertext::parse(stored) {
            StoredCiphertext::Envelope(envelope) => self.open(&envelope),
            StoredCiphertext::LegacyPlaintext(text) => {
                let preview: String = text.chars().take(LEGACY_PREVIEW_CHARS).collect();
                warn!(preview = %format!("{preview}..."), "legacy plaintext secret read");
                Ok(text)
            }
        }
    }

    pub fn open(&self, envelope: &Envelope) -> Result<String, CodecError> {
        let key = self
            .keys
            .get(envelope.kv)
            .ok_or(CodecError::UnknownKey(envelope.kv))?;

        let mut sealed =
            hex::decode(&envelope.encrypted).map_err(|_| CodecError::Malformed("encrypted"))?;
        let iv: [u8; NONCE_LEN] = hex::decode(&envelope.iv)
            .map_err(|_| CodecError::Malformed("iv"))?
            .try_into()
            .map_err(|_| CodecError::Malformed("iv length"))?;
        let tag = hex::decode(&envelope.tag).map_err(|_| CodecError::Malformed("tag"))?;
        if tag.len() != TAG_LEN {
            return Err(CodecError::Malformed("tag length"));
        }
        sealed.extend_from_slice(&tag);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let plaintext = cipher
            .decrypt(&Nonce::from(iv), sealed.as_slice())
            .map_err(|_| CodecError::TagMismatch)?;

        String::from_utf8(plaintext).map_err(|_| CodecError::Utf8)
    }

    /// True when `stored` is not sealed under the current primary key.
    pub fn needs_reseal(&self, stored: &str) -> bool {
        match StoredCiphertext::parse(stored) {
            StoredCiphertext::Envelope(envelope) => envelope.kv != self.keys.primary_version(),
            StoredCiphertext::LegacyPlaintext(_) => true,
        }
    }

    /// Decrypt with whatever key sealed `stored` and re-encrypt under the primary key.
    pub fn reseal(&self, stored: &str) -> Result<String, CodecError> {
        let plaintext = self.decrypt(stored)?;
        self.encrypt(&plaintext)
    }

    pub fn self_test(&self) -> bool {
        match self.encrypt(SELF_TEST_PROBE).and_then(|sealed| self.decrypt(&sealed)) {
            Ok(opened) => opened == SELF_TEST_PROBE,
            Err(e) => {
                error!(error = %e, "encryption self-test round trip failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(Keyring::new(1, EncryptionKey::generate()))
    }

    #[test]
    fn round_trip() {
        let c = codec();
        let sealed = c.encrypt("hello, secretshare!").unwrap();
        assert_eq!(c.decrypt(&sealed).unwrap(), "hello, secretshare!");
    }

    #[test]
    fn round_trip_unicode_and_empty() {
        let c = codec();
        for text in ["", "ünïcödé 🔥 秘密", "line one\nline two\t"] {
            assert_eq!(c.decrypt(&c.encrypt(text).unwrap()).unwrap(), text);
        }
    }

    #[test]
    fn same_plaintext_gets_fresh_nonce() {
        let c = codec();
        let a = StoredCiphertext::parse(&c.encrypt("same").unwrap());
        let b = StoredCiphertext::parse(&c.encrypt("same").unwrap());
        let (StoredCiphertext::Envelope(a), StoredCiphertext::Envelope(b)) = (a, b) else {
            panic!("expected envelopes");
        };
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.encrypted, b.encrypted);
    }

    #[test]
    fn envelope_fields_have_fixed_lengths() {
        let c = codec();
        let StoredCiphertext::Envelope(env) = StoredCiphertext::parse(&c.encrypt("abc").unwrap())
        else {
            panic!("expected envelope");
        };
        assert_eq!(env.kv, 1);
        assert_eq!(env.iv.len(), NONCE_LEN * 2);
        assert_eq!(env.tag.len(), TAG_LEN * 2);
        assert_eq!(env.encrypted.len(), 3 * 2);
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let c = codec();
        let StoredCiphertext::Envelope(mut env) =
            StoredCiphertext::parse(&c.encrypt("do not touch").unwrap())
        else {
            panic!("expected envelope");
        };
        let mut bytes = hex::decode(&env.encrypted).unwrap();
        bytes[0] ^= 0x01;
        env.encrypted = hex::encode(bytes);
        assert_eq!(c.open(&env), Err(CodecError::TagMismatch));
    }

    #[test]
    fn tampered_tag_fails() {
        let c = codec();
        let StoredCiphertext::Envelope(mut env) =
            StoredCiphertext::parse(&c.encrypt("do not touch").unwrap())
        else {
            panic!("expected envelope");
        };
        env.tag = "00".repeat(TAG_LEN);
        let stored = serde_json::to_string(&env).unwrap();
        assert_eq!(c.decrypt(&stored), Err(CodecError::TagMismatch));
    }

    #[test]
    fn wrong_iv_length_is_malformed() {
        let c = codec();
        let StoredCiphertext::Envelope(mut env) =
            StoredCiphertext::parse(&c.encrypt("x").unwrap())
        else {
            panic!("expected envelope");
        };
        env.iv = "00".repeat(16);
        assert_eq!(c.open(&env), Err(CodecError::Malformed("iv length")));
    }

    #[test]
    fn wrong_key_fails() {
        let a = codec();
        let b = codec();
        let sealed = a.encrypt("secret").unwrap();
        assert_eq!(b.decrypt(&sealed), Err(CodecError::TagMismatch));
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let c = codec();
        assert_eq!(c.decrypt("just some old text").unwrap(), "just some old text");
        assert_eq!(c.decrypt("{\"not\":\"an envelope\"}").unwrap(), "{\"not\":\"an envelope\"}");
    }

    #[test]
    fn envelope_without_version_defaults_to_one() {
        let c = codec();
        let StoredCiphertext::Envelope(env) = StoredCiphertext::parse(&c.encrypt("v1").unwrap())
        else {
            panic!("expected envelope");
        };
        let unversioned = serde_json::json!({
            "encrypted": env.encrypted,
            "iv": env.iv,
            "tag": env.tag,
        })
        .to_string();
        assert_eq!(c.decrypt(&unversioned).unwrap(), "v1");
    }

    #[test]
    fn retired_key_still_decrypts_and_reseals() {
        let old_key = EncryptionKey::generate();
        let old_hex = old_key.to_hex();
        let old = Codec::new(Keyring::new(1, old_key));
        let sealed = old.encrypt("rotate me").unwrap();

        let ring = Keyring::new(2, EncryptionKey::generate())
            .with_retired(1, EncryptionKey::parse(&old_hex).unwrap())
            .unwrap();
        let current = Codec::new(ring);

        assert!(current.needs_reseal(&sealed));
        assert_eq!(current.decrypt(&sealed).unwrap(), "rotate me");

        let resealed = current.reseal(&sealed).unwrap();
        assert!(!current.needs_reseal(&resealed));
        assert_eq!(current.decrypt(&resealed).unwrap(), "rotate me");
        assert!(old.decrypt(&resealed).is_err());
    }

    #[test]
    fn unknown_key_version_fails() {
        let c = codec();
        let StoredCiphertext::Envelope(mut env) =
            StoredCiphertext::parse(&c.encrypt("x").unwrap())
        else {
            panic!("expected envelope");
        };
        env.kv = 9;
        assert_eq!(c.open(&env), Err(CodecError::UnknownKey(9)));
    }

    #[test]
    fn duplicate_key_version_rejected() {
        let ring = Keyring::new(1, EncryptionKey::generate());
        assert!(ring.with_retired(1, EncryptionKey::generate()).is_err());
    }

    #[test]
    fn parse_hex_and_base64_keys() {
        let key = EncryptionKey::generate();
        let from_hex = EncryptionKey::parse(&key.to_hex()).unwrap();
        assert_eq!(from_hex.as_bytes(), key.as_bytes());

        let b64 = STANDARD.encode(key.as_bytes());
        assert_eq!(b64.len(), 44);
        let from_b64 = EncryptionKey::parse(&b64).unwrap();
        assert_eq!(from_b64.as_bytes(), key.as_bytes());
    }

    #[test]
    fn parse_rejects_bad_lengths() {
        assert!(EncryptionKey::parse("abcd").is_err());
        assert!(EncryptionKey::parse(&"zz".repeat(32)).is_err());
        assert!(EncryptionKey::from_bytes(&[0u8; 31]).is_none());
    }

    #[test]
    fn self_test_passes() {
        assert!(codec().self_test());
        assert!(Codec::ephemeral().self_test());
    }
}
