//! Encrypted key share storage
//!
//! Key shares are sealed at rest with ChaCha20-Poly1305 under a key derived
//! from the operator passphrase with Argon2id. The cost parameters are stored
//! in the file header, so they can be raised without breaking older files.

use crate::{Error, KeyShare, ParticipantId, Result};
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

const FORMAT_VERSION: u8 = 2;

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory in KiB
    pub m_cost: u32,
    /// Passes over memory
    pub t_cost: u32,
    /// Lanes
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

impl KdfParams {
    fn derive(&self, passphrase: &str, salt: &[u8], key: &mut [u8; 32]) -> Result<()> {
        let params = Params::new(self.m_cost, self.t_cost, self.p_cost, Some(key.len()))
            .map_err(|e| Error::Keystore(format!("invalid KDF parameters: {}", e)))?;
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(passphrase.as_bytes(), salt, key)
            .map_err(|e| Error::Keystore(format!("key derivation failed: {}", e)))
    }
}

/// On-disk format
#[derive(Debug, Serialize, Deserialize)]
struct EncryptedKeyFile {
    version: u8,
    participant_id: ParticipantId,
    threshold: usize,
    total: usize,
    #[serde(with = "hex")]
    group_public_key: [u8; 32],
    kdf: KdfParams,
    #[serde(with = "hex")]
    salt: [u8; 16],
    #[serde(with = "hex")]
    nonce: [u8; 12],
    #[serde(with = "hex")]
    ciphertext: Vec<u8>,
}

impl EncryptedKeyFile {
    /// Public header fields are authenticated with the ciphertext
    fn associated_data(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(1 + 2 + 16 + 32 + 12);
        aad.push(self.version);
        aad.extend_from_slice(&self.participant_id.to_be_bytes());
        aad.extend_from_slice(&(self.threshold as u64).to_be_bytes());
        aad.extend_from_slice(&(self.total as u64).to_be_bytes());
        aad.extend_from_slice(&self.group_public_key);
        for cost in [self.kdf.m_cost, self.kdf.t_cost, self.kdf.p_cost] {
            aad.extend_from_slice(&cost.to_be_bytes());
        }
        aad
    }
}

/// Public metadata readable without the passphrase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreInfo {
    pub participant_id: ParticipantId,
    pub threshold: usize,
    pub total: usize,
    #[serde(with = "hex")]
    pub group_public_key: [u8; 32],
}

/// Passphrase-protected key share file
pub struct Keystore {
    path: PathBuf,
    kdf: KdfParams,
}

impl Keystore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            kdf: KdfParams::default(),
        }
    }

    /// Cost parameters used by [`Keystore::save`]; loading always uses the
    /// parameters recorded in the file
    pub fn with_kdf(mut self, kdf: KdfParams) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn cipher(kdf: &KdfParams, passphrase: &str, salt: &[u8]) -> Result<ChaCha20Poly1305> {
        let mut key = Zeroizing::new([0u8; 32]);
        kdf.derive(passphrase, salt, &mut key)?;
        Ok(ChaCha20Poly1305::new(Key::from_slice(&key[..])))
    }

    /// Encrypt and write a key share, replacing any previous file
    pub fn save(&self, key_share: &KeyShare, passphrase: &str) -> Result<()> {
        key_share.check_consistency()?;

        let mut salt = [0u8; 16];
        let mut nonce = [0u8; 12];
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut nonce);

        let mut file = EncryptedKeyFile {
            version: FORMAT_VERSION,
            participant_id: key_share.participant_id,
            threshold: key_share.threshold,
            total: key_share.total,
            group_public_key: key_share.group_public_key,
            kdf: self.kdf,
            salt,
            nonce,
            ciphertext: Vec::new(),
        };

        let plaintext = Zeroizing::new(serde_json::to_vec(key_share)?);
        let aad = file.associated_data();
        file.ciphertext = Self::cipher(&self.kdf, passphrase, &salt)?
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext.as_slice(),
                    aad: &aad,
                },
            )
            .map_err(|_| Error::Keystore("encryption failed".into()))?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;

        tracing::info!(
            participant_id = key_share.participant_id,
            path = %self.path.display(),
            "Saved encrypted key share"
        );
        Ok(())
    }

    fn read_file(&self) -> Result<EncryptedKeyFile> {
        if !self.exists() {
            return Err(Error::Keystore(format!(
                "no key share at {}",
                self.path.display()
            )));
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let file: EncryptedKeyFile =
            serde_json::from_str(&raw).map_err(|e| Error::Keystore(e.to_string()))?;
        if file.version != FORMAT_VERSION {
            return Err(Error::Keystore(format!(
                "unsupported keystore version {}",
                file.version
            )));
        }
        Ok(file)
    }

    /// Decrypt the key share
    pub fn load(&self, passphrase: &str) -> Result<KeyShare> {
        let file = self.read_file()?;
        let aad = file.associated_data();
        let plaintext = Zeroizing::new(
            Self::cipher(&file.kdf, passphrase, &file.salt)?
                .decrypt(
                    Nonce::from_slice(&file.nonce),
                    Payload {
                        msg: &file.ciphertext,
                        aad: &aad,
                    },
                )
                .map_err(|_| Error::Keystore("wrong passphrase or corrupted file".into()))?,
        );

        let key_share: KeyShare = serde_json::from_slice(plaintext.as_slice())
            .map_err(|e| Error::Keystore(e.to_string()))?;
        if key_share.participant_id != file.participant_id
            || key_share.group_public_key != file.group_public_key
        {
            return Err(Error::Keystore("header does not match key share".into()));
        }
        key_share.check_consistency()?;

        tracing::info!(
            participant_id = key_share.participant_id,
            path = %self.path.display(),
            "Loaded key share"
        );
        Ok(key_share)
    }

    /// Read the public header without decrypting
    pub fn info(&self) -> Result<KeystoreInfo> {
        let file = self.read_file()?;
        Ok(KeystoreInfo {
            participant_id: file.participant_id,
            threshold: file.threshold,
            total: file.total,
            group_public_key: file.group_public_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::dealer_shares;

    const CHEAP: KdfParams = KdfParams {
        m_cost: 64,
        t_cost: 1,
        p_cost: 1,
    };

    fn keystore(path: impl AsRef<Path>) -> Keystore {
        Keystore::new(path).with_kdf(CHEAP)
    }

    #[test]
    fn test_keystore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = keystore(dir.path().join("nested").join("share.json"));
        let share = dealer_shares(2, 3, 71).remove(1);

        keystore.save(&share, "correct horse").unwrap();
        let loaded = keystore.load("correct horse").unwrap();
        assert_eq!(loaded.participant_id, 2);
        assert_eq!(loaded.group_public_key, share.group_public_key);
        assert_eq!(loaded.verifying_shares, share.verifying_shares);

        let info = keystore.info().unwrap();
        assert_eq!(info.threshold, 2);
        assert_eq!(info.group_public_key, share.group_public_key);
    }

    #[test]
    fn test_keystore_wrong_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let keystore = keystore(dir.path().join("share.json"));
        keystore
            .save(&dealer_shares(2, 3, 72)[0], "passphrase")
            .unwrap();

        assert!(matches!(
            keystore.load("not the passphrase"),
            Err(Error::Keystore(_))
        ));
    }

    #[test]
    fn test_keystore_header_is_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.json");
        let keystore = keystore(&path);
        keystore.save(&dealer_shares(2, 3, 73)[0], "pw").unwrap();

        let mut file: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        file["threshold"] = serde_json::json!(1);
        std::fs::write(&path, file.to_string()).unwrap();

        assert!(keystore.load("pw").is_err());
    }

    #[test]
    fn test_missing_file() {
        let keystore = Keystore::new("/nonexistent/share.json");
        assert!(!keystore.exists());
        assert!(matches!(keystore.info(), Err(Error::Keystore(_))));
    }

    #[test]
    fn test_kdf_parameters_travel_with_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("share.json");
        let share = dealer_shares(2, 3, 74).remove(0);
        keystore(&path).save(&share, "pw").unwrap();

        // A reader configured with different costs still opens the file
        let loaded = Keystore::new(&path).load("pw").unwrap();
        assert_eq!(loaded.group_public_key, share.group_public_key);

        // Lowering the recorded cost is caught by the header authentication
        let mut file: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(file["kdf"]["m_cost"], serde_json::json!(64));
        file["kdf"]["m_cost"] = serde_json::json!(32);
        std::fs::write(&path, file.to_string()).unwrap();
        assert!(matches!(Keystore::new(&path).load("pw"), Err(Error::Keystore(_))));
    }
}
