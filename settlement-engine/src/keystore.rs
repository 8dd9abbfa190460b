//! Seed vault
//!
//! Wallet key material is stored encrypted with XChaCha20-Poly1305 under a key
//! stretched by Argon2id from the vault master secret and the owning user's id.
//! Plaintext only exists inside `Zeroizing` buffers for the duration of a
//! signing call.

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, NewAead},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{SettlementError, SettlementResult};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Ciphertext plus the parameters needed to open it, hex encoded
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

/// Encrypts and decrypts per-user key material
pub struct SeedVault {
    master_secret: Zeroizing<Vec<u8>>,
    params: Params,
}

impl std::fmt::Debug for SeedVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SeedVault").finish_non_exhaustive()
    }
}

impl SeedVault {
    pub fn new(master_secret: &str, memory_kib: u32, iterations: u32) -> SettlementResult<Self> {
        if master_secret.is_empty() {
            return Err(SettlementError::config("Vault master secret cannot be empty"));
        }
        let params = Params::new(memory_kib, iterations, 1, Some(KEY_LEN))
            .map_err(|e| SettlementError::config(format!("Invalid Argon2id params: {}", e)))?;

        Ok(Self {
            master_secret: Zeroizing::new(master_secret.as_bytes().to_vec()),
            params,
        })
    }

    /// Encrypt `plaintext` for `user_id`
    pub fn seal(&self, user_id: &str, plaintext: &str) -> SettlementResult<EncryptedSecret> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(user_id, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| SettlementError::crypto(format!("Failed to encrypt secret: {}", e)))?;

        Ok(EncryptedSecret {
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    /// Decrypt a secret previously sealed for `user_id`
    pub fn open(&self, user_id: &str, sealed: &EncryptedSecret) -> SettlementResult<Zeroizing<String>> {
        let salt = decode_field(&sealed.salt, "salt")?;
        let nonce = decode_field(&sealed.nonce, "nonce")?;
        let ciphertext = decode_field(&sealed.ciphertext, "ciphertext")?;
        if nonce.len() != NONCE_LEN {
            return Err(SettlementError::crypto("Sealed secret has a malformed nonce"));
        }

        let key = self.derive_key(user_id, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(XNonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| SettlementError::crypto("Failed to decrypt secret (wrong owner or corrupted)"))?,
        );

        let text = std::str::from_utf8(plaintext.as_slice())
            .map_err(|_| SettlementError::crypto("Decrypted secret is not valid UTF-8"))?;
        Ok(Zeroizing::new(text.to_string()))
    }

    fn derive_key(&self, user_id: &str, salt: &[u8]) -> SettlementResult<Zeroizing<[u8; KEY_LEN]>> {
        let mut password = Zeroizing::new(self.master_secret.to_vec());
        password.push(0);
        password.extend_from_slice(user_id.as_bytes());

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
            .hash_password_into(password.as_slice(), salt, &mut key[..])
            .map_err(|e| SettlementError::crypto(format!("Argon2id key derivation failed: {}", e)))?;
        Ok(key)
    }
}

fn decode_field(value: &str, name: &str) -> SettlementResult<Vec<u8>> {
    hex::decode(value).map_err(|_| SettlementError::crypto(format!("Sealed secret has a malformed {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> SeedVault {
        SeedVault::new("test-master-secret-0123456789", 64, 1).unwrap()
    }

    #[test]
    fn test_seal_and_open() {
        let vault = vault();
        let sealed = vault.seal("alice", "abandon ability able").unwrap();
        assert!(!sealed.ciphertext.contains("abandon"));

        let opened = vault.open("alice", &sealed).unwrap();
        assert_eq!(opened.as_str(), "abandon ability able");
    }

    #[test]
    fn test_other_user_cannot_open() {
        let vault = vault();
        let sealed = vault.seal("alice", "secret words").unwrap();
        assert!(matches!(vault.open("bob", &sealed), Err(SettlementError::Crypto(_))));
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_seal() {
        let vault = vault();
        let a = vault.seal("alice", "same").unwrap();
        let b = vault.seal("alice", "same").unwrap();
        assert_ne!(a.salt, b.salt);
        assert_ne!(a.ciphertext, b.ciphertext);
    }
}
