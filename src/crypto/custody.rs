//! Certificate passphrase encryption at rest
//!
//! A tenant key is derived from the process master key with PBKDF2-HMAC-SHA256
//! over `salt || tenant_id`, then the passphrase is sealed with AES-256-GCM.
//! The tenant id is also bound as AAD, so a bundle copied to another tenant's
//! row fails authentication instead of decrypting.
//!
//! Changing the iteration count makes existing bundles undecryptable; rotate
//! certificates when changing it.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::{Zeroize, Zeroizing};

use crate::domain::{EncryptedPassphrase, TenantId};

/// AES-GCM nonce size
pub const IV_SIZE: usize = 12;

/// AES-GCM tag size
pub const TAG_SIZE: usize = 16;

/// Random part of the key-derivation salt
pub const SALT_SIZE: usize = 16;

pub const DEFAULT_KDF_ITERATIONS: u32 = 210_000;

/// Lowest iteration count accepted from configuration
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum CustodyError {
    #[error("custody configuration error: {0}")]
    Configuration(String),

    /// Authentication tag mismatch: tampered bundle, wrong tenant or wrong master key
    #[error("passphrase bundle failed authentication")]
    Integrity,

    #[error("malformed passphrase bundle: {0}")]
    MalformedBundle(String),

    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
}

/// The 256-bit process master key. Zeroed on drop; never printed.
#[derive(Clone)]
pub struct MasterKey(Box<[u8; 32]>);

impl MasterKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Box::new(bytes))
    }

    /// Parse a 32-byte key given as hex (optionally `0x`-prefixed) or base64
    pub fn parse(s: &str) -> Result<Self, CustodyError> {
        let trimmed = s.trim();
        let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);

        let mut bytes = if hex_str.len() == 64 && hex_str.chars().all(|c| c.is_ascii_hexdigit()) {
            hex::decode(hex_str).map_err(|e| {
                CustodyError::Configuration(format!("invalid REGISTRY_MASTER_KEY hex: {e}"))
            })?
        } else {
            STANDARD
                .decode(trimmed)
                .or_else(|_| URL_SAFE_NO_PAD.decode(trimmed))
                .map_err(|e| {
                    CustodyError::Configuration(format!("invalid REGISTRY_MASTER_KEY base64: {e}"))
                })?
        };

        let key: Result<[u8; 32], _> = bytes.as_slice().try_into();
        bytes.zeroize();
        key.map(Self::from_bytes).map_err(|_| {
            CustodyError::Configuration("REGISTRY_MASTER_KEY must be 32 bytes".to_string())
        })
    }

    fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        let bytes: &mut [u8; 32] = &mut self.0;
        bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterKey([REDACTED])")
    }
}

/// Seals and opens certificate passphrases for any tenant
#[derive(Debug, Clone)]
pub struct PassphraseCipher {
    master_key: MasterKey,
    iterations: u32,
}

impl PassphraseCipher {
    pub fn new(master_key: MasterKey, iterations: u32) -> Self {
        Self {
            master_key,
            iterations: iterations.max(1),
        }
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    fn derive_key(&self, salt: &[u8], tenant_id: TenantId) -> Zeroizing<[u8; 32]> {
        let mut kdf_salt = Vec::with_capacity(salt.len() + 16);
        kdf_salt.extend_from_slice(salt);
        kdf_salt.extend_from_slice(tenant_id.0.as_bytes());

        let mut key = Zeroizing::new([0u8; 32]);
        pbkdf2::pbkdf2_hmac::<Sha256>(
            self.master_key.as_bytes(),
            &kdf_salt,
            self.iterations,
            &mut *key,
        );
        key
    }

    /// Encrypt a passphrase for `tenant_id` with a fresh salt and IV
    pub fn encrypt(
        &self,
        passphrase: &SecretString,
        tenant_id: TenantId,
    ) -> Result<EncryptedPassphrase, CustodyError> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt, tenant_id);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| CustodyError::EncryptionFailed(e.to_string()))?;

        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: passphrase.expose_secret().as_bytes(),
                    aad: tenant_id.0.as_bytes(),
                },
            )
            .map_err(|e| CustodyError::EncryptionFailed(e.to_string()))?;

        let auth_tag = sealed.split_off(sealed.len() - TAG_SIZE);

        Ok(EncryptedPassphrase {
            ciphertext: STANDARD.encode(&sealed),
            iv: STANDARD.encode(iv),
            salt: STANDARD.encode(salt),
            auth_tag: STANDARD.encode(auth_tag),
        })
    }

    /// Decrypt a bundle for `tenant_id`.
    ///
    /// Fails with [`CustodyError::Integrity`] whenever the tag does not verify.
    pub fn decrypt(
        &self,
        bundle: &EncryptedPassphrase,
        tenant_id: TenantId,
    ) -> Result<SecretString, CustodyError> {
        let ciphertext = decode_component("ciphertext", &bundle.ciphertext, None)?;
        let iv = decode_component("iv", &bundle.iv, Some(IV_SIZE))?;
        let salt = decode_component("salt", &bundle.salt, Some(SALT_SIZE))?;
        let auth_tag = decode_component("auth_tag", &bundle.auth_tag, Some(TAG_SIZE))?;

        let key = self.derive_key(&salt, tenant_id);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice())
            .map_err(|e| CustodyError::EncryptionFailed(e.to_string()))?;

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&auth_tag);

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&iv),
                    Payload {
                        msg: &sealed,
                        aad: tenant_id.0.as_bytes(),
                    },
                )
                .map_err(|_| CustodyError::Integrity)?,
        );

        let passphrase = std::str::from_utf8(&plaintext)
            .map_err(|_| CustodyError::MalformedBundle("passphrase is not UTF-8".to_string()))?;
        Ok(SecretString::from(passphrase.to_string()))
    }
}

fn decode_component(
    name: &str,
    value: &str,
    expected_len: Option<usize>,
) -> Result<Vec<u8>, CustodyError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| CustodyError::MalformedBundle(format!("{name}: {e}")))?;
    match expected_len {
        Some(len) if bytes.len() != len => Err(CustodyError::MalformedBundle(format!(
            "{name}: expected {len} bytes, got {}",
            bytes.len()
        ))),
        _ => Ok(bytes),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> PassphraseCipher {
        PassphraseCipher::new(MasterKey::from_bytes([7u8; 32]), 1_000)
    }

    fn secret(s: &str) -> SecretString {
        SecretString::from(s.to_string())
    }

    #[test]
    fn test_round_trip_same_tenant() {
        let tenant = TenantId::new();
        let bundle = cipher().encrypt(&secret("p4ss w0rd"), tenant).unwrap();
        let plain = cipher().decrypt(&bundle, tenant).unwrap();
        assert_eq!(plain.expose_secret(), "p4ss w0rd");
    }

    #[test]
    fn test_bundle_never_contains_plaintext() {
        let bundle = cipher().encrypt(&secret("hunter2"), TenantId::new()).unwrap();
        let json = serde_json::to_string(&bundle).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!format!("{bundle:?}").contains(&bundle.ciphertext));
    }

    #[test]
    fn test_fresh_salt_and_iv_each_time() {
        let tenant = TenantId::new();
        let a = cipher().encrypt(&secret("same"), tenant).unwrap();
        let b = cipher().encrypt(&secret("same"), tenant).unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
    }

    #[test]
    fn test_other_tenant_fails_integrity() {
        let bundle = cipher().encrypt(&secret("secret"), TenantId::new()).unwrap();
        let err = cipher().decrypt(&bundle, TenantId::new()).unwrap_err();
        assert!(matches!(err, CustodyError::Integrity));
    }

    #[test]
    fn test_tampered_ciphertext_fails_integrity() {
        let tenant = TenantId::new();
        let mut bundle = cipher().encrypt(&secret("secret"), tenant).unwrap();
        let mut raw = STANDARD.decode(&bundle.ciphertext).unwrap();
        raw[0] ^= 0x01;
        bundle.ciphertext = STANDARD.encode(raw);
        assert!(matches!(
            cipher().decrypt(&bundle, tenant),
            Err(CustodyError::Integrity)
        ));
    }

    #[test]
    fn test_wrong_master_key_fails_integrity() {
        let tenant = TenantId::new();
        let bundle = cipher().encrypt(&secret("secret"), tenant).unwrap();
        let other = PassphraseCipher::new(MasterKey::from_bytes([8u8; 32]), 1_000);
        assert!(matches!(
            other.decrypt(&bundle, tenant),
            Err(CustodyError::Integrity)
        ));
    }

    #[test]
    fn test_truncated_tag_is_malformed() {
        let tenant = TenantId::new();
        let mut bundle = cipher().encrypt(&secret("secret"), tenant).unwrap();
        bundle.auth_tag = STANDARD.encode([0u8; 4]);
        assert!(matches!(
            cipher().decrypt(&bundle, tenant),
            Err(CustodyError::MalformedBundle(_))
        ));
    }

    #[test]
    fn test_master_key_parses_hex_and_base64() {
        let hex_key = "0x".to_string() + &"ab".repeat(32);
        assert!(MasterKey::parse(&hex_key).is_ok());
        assert!(MasterKey::parse(&STANDARD.encode([1u8; 32])).is_ok());
        assert!(matches!(
            MasterKey::parse("too-short"),
            Err(CustodyError::Configuration(_))
        ));
        assert_eq!(
            format!("{:?}", MasterKey::from_bytes([1u8; 32])),
            "MasterKey([REDACTED])"
        );
    }
}
