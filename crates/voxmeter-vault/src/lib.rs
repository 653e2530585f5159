//! Authenticated encryption-at-rest for provider API keys.
//!
//! Blobs are `base64(salt ∥ iv ∥ tag ∥ ciphertext)` with a fresh random
//! 64-byte salt and 16-byte IV per call. The per-blob key is derived from a
//! server-held passphrase with PBKDF2-HMAC-SHA512, so a leaked database alone
//! is not enough to recover any secret.

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha512;
use thiserror::Error;
use tracing::instrument;

const SALT_LEN: usize = 64;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const TAG_OFFSET: usize = SALT_LEN + IV_LEN;
const CIPHERTEXT_OFFSET: usize = TAG_OFFSET + TAG_LEN;

const KDF_ITERATIONS: u32 = 100_000;
const MIN_PASSPHRASE_CHARS: usize = 32;

/// Environment variable holding the server passphrase.
pub const PASSPHRASE_ENV: &str = "VOXMETER_PASSPHRASE";

// AES-256-GCM with the 16-byte IV the blob layout mandates.
type VaultCipher = AesGcm<Aes256, U16>;

/// Errors produced by the vault.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    /// Passphrase missing or too short. Fatal; fix the deployment, do not retry.
    #[error("vault misconfigured: {reason}")]
    Configuration { reason: String },
    /// Unexpected cipher failure while encrypting. Treated as a bug.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },
    /// Tag mismatch or malformed blob: wrong passphrase, corruption, or tampering.
    /// The affected secret is unrecoverable until its owner re-enters it.
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },
}

/// Reversible at-rest protection for secret strings. Each call draws its own
/// randomness; instances are safe to share across tasks.
#[derive(Debug)]
pub struct Vault {
    key_material: String,
}

impl Vault {
    /// Build a vault from an explicit passphrase (used directly in tests;
    /// production goes through [`Vault::from_env`]).
    pub fn new(passphrase: &str) -> Result<Self, VaultError> {
        if passphrase.chars().count() < MIN_PASSPHRASE_CHARS {
            return Err(VaultError::Configuration {
                reason: format!(
                    "passphrase must be at least {MIN_PASSPHRASE_CHARS} characters \
                     (generate one with: openssl rand -base64 32)"
                ),
            });
        }
        // Only the first 32 characters feed the KDF; extra entropy is ignored.
        Ok(Self {
            key_material: passphrase.chars().take(MIN_PASSPHRASE_CHARS).collect(),
        })
    }

    /// Read and validate the passphrase from `VOXMETER_PASSPHRASE`.
    pub fn from_env() -> Result<Self, VaultError> {
        let passphrase =
            std::env::var(PASSPHRASE_ENV).map_err(|_| VaultError::Configuration {
                reason: format!(
                    "{PASSPHRASE_ENV} is not set \
                     (generate one with: openssl rand -base64 32)"
                ),
            })?;
        Self::new(&passphrase)
    }

    /// Encrypt a plaintext secret into a printable blob.
    /// Deliberately expensive: the KDF runs 100k iterations per call.
    #[instrument(skip_all)]
    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut iv);

        let cipher = self.cipher_for(&salt).map_err(|reason| VaultError::Encryption { reason })?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption {
                reason: format!("cipher failure: {e}"),
            })?;

        // The aead API appends the tag to the ciphertext; the blob layout
        // wants the tag ahead of it.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut blob = Vec::with_capacity(CIPHERTEXT_OFFSET + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);
        Ok(BASE64.encode(blob))
    }

    /// Decrypt a blob produced by [`Vault::encrypt`] under the same passphrase.
    /// Fails explicitly on any malformed or tampered input; never returns garbage.
    #[instrument(skip_all)]
    pub fn decrypt(&self, blob: &str) -> Result<String, VaultError> {
        let data = BASE64.decode(blob).map_err(|e| VaultError::Decryption {
            reason: format!("blob is not valid base64: {e}"),
        })?;
        if data.len() < CIPHERTEXT_OFFSET {
            return Err(VaultError::Decryption {
                reason: format!(
                    "blob too short: {} bytes, need at least {CIPHERTEXT_OFFSET}",
                    data.len()
                ),
            });
        }

        let salt = &data[..SALT_LEN];
        let iv = &data[SALT_LEN..TAG_OFFSET];
        let tag = &data[TAG_OFFSET..CIPHERTEXT_OFFSET];
        let ciphertext = &data[CIPHERTEXT_OFFSET..];

        let cipher = self.cipher_for(salt).map_err(|reason| VaultError::Decryption { reason })?;

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_ref())
            .map_err(|_| VaultError::Decryption {
                reason: "authentication tag mismatch (wrong passphrase, corrupted \
                         blob, or tampering)"
                    .to_string(),
            })?;

        String::from_utf8(plaintext).map_err(|e| VaultError::Decryption {
            reason: format!("plaintext is not valid UTF-8: {e}"),
        })
    }

    fn cipher_for(&self, salt: &[u8]) -> Result<VaultCipher, String> {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha512>(self.key_material.as_bytes(), salt, KDF_ITERATIONS, &mut key);
        VaultCipher::new_from_slice(&key).map_err(|e| format!("cipher init failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> Vault {
        Vault::new(&"x".repeat(32)).expect("valid passphrase")
    }

    #[test]
    fn round_trip_restores_plaintext() {
        let vault = test_vault();
        let blob = vault.encrypt("sk_live_abc123").expect("encrypt");
        assert!(!blob.is_empty());
        assert_ne!(blob, "sk_live_abc123");
        assert_eq!(vault.decrypt(&blob).expect("decrypt"), "sk_live_abc123");
    }

    #[test]
    fn encrypt_is_nondeterministic() {
        let vault = test_vault();
        let first = vault.encrypt("same-secret").expect("encrypt");
        let second = vault.encrypt("same-secret").expect("encrypt");
        assert_ne!(first, second, "salt/iv must differ per call");
        assert_eq!(vault.decrypt(&first).expect("decrypt"), "same-secret");
        assert_eq!(vault.decrypt(&second).expect("decrypt"), "same-secret");
    }

    #[test]
    fn tampering_is_detected_in_every_section() {
        let vault = test_vault();
        let blob = vault.encrypt("tamper-check").expect("encrypt");
        let bytes = BASE64.decode(&blob).expect("decode");

        // One flipped byte in each structural section of the blob.
        for position in [0, SALT_LEN, TAG_OFFSET, CIPHERTEXT_OFFSET] {
            let mut corrupted = bytes.clone();
            corrupted[position] ^= 0x01;
            let err = vault
                .decrypt(&BASE64.encode(&corrupted))
                .expect_err("corrupted blob must not decrypt");
            assert!(matches!(err, VaultError::Decryption { .. }));
        }
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let blob = test_vault().encrypt("secret").expect("encrypt");
        let other = Vault::new(&"y".repeat(32)).expect("valid passphrase");
        let err = other.decrypt(&blob).expect_err("wrong passphrase");
        assert!(matches!(err, VaultError::Decryption { .. }));
    }

    #[test]
    fn short_passphrase_is_a_configuration_error() {
        let err = Vault::new("too-short").expect_err("must reject");
        assert!(matches!(err, VaultError::Configuration { .. }));
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        let vault = test_vault();

        let err = vault.decrypt("not base64!!!").expect_err("bad encoding");
        assert!(matches!(err, VaultError::Decryption { .. }));

        // Valid base64, but shorter than salt + iv + tag.
        let short = BASE64.encode([0u8; 40]);
        let err = vault.decrypt(&short).expect_err("truncated blob");
        assert!(matches!(err, VaultError::Decryption { .. }));
    }

    #[test]
    fn only_first_32_characters_matter() {
        let base = "p".repeat(32);
        let vault = Vault::new(&base).expect("valid");
        let extended = Vault::new(&format!("{base}-trailing-entropy")).expect("valid");

        let blob = vault.encrypt("shared").expect("encrypt");
        assert_eq!(extended.decrypt(&blob).expect("decrypt"), "shared");
    }
}
