//! Payload cipher with a persistent per-peer key store.
//!
//! Payload bodies can be encrypted per peer with AES-256-CBC and a random
//! per-message IV. Keys are exchanged out of band and stored in a versioned
//! JSON key store on disk.
//!
//! Wire format of a ciphertext (Base64-decoded): `iv (16 bytes) + ciphertext`.

use std::collections::HashMap;
use std::path::PathBuf;

use aes::Aes256;
use base64::Engine;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cbc::{Decryptor, Encryptor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use wl_core::error::{WlError, WlResult};

type Aes256CbcEnc = Encryptor<Aes256>;
type Aes256CbcDec = Decryptor<Aes256>;

const KEY_STORE_VERSION: u32 = 1;

/// On-disk shape of the key store.
#[derive(Serialize, Deserialize)]
struct KeyStoreFile {
    version: u32,
    /// peer id -> base64-encoded 32-byte key
    keys: HashMap<String, String>,
}

/// Per-peer AES-256-CBC cipher backed by a persistent key store.
pub struct PayloadCipher {
    path: PathBuf,
    keys: HashMap<String, [u8; 32]>,
}

impl PayloadCipher {
    /// Open the key store at `path`; a missing file means no keys yet.
    pub fn load(path: impl Into<PathBuf>) -> WlResult<Self> {
        let path = path.into();
        let mut keys = HashMap::new();

        if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            let file: KeyStoreFile = serde_json::from_str(&contents)
                .map_err(|e| WlError::Crypto(format!("unreadable key store: {e}")))?;
            if file.version != KEY_STORE_VERSION {
                return Err(WlError::Crypto(format!(
                    "unsupported key store version {}",
                    file.version
                )));
            }
            for (peer, encoded) in file.keys {
                let raw = base64::engine::general_purpose::STANDARD
                    .decode(&encoded)
                    .map_err(|e| WlError::Crypto(format!("bad key for {peer}: {e}")))?;
                let key: [u8; 32] = raw
                    .try_into()
                    .map_err(|_| WlError::Crypto(format!("key for {peer} is not 32 bytes")))?;
                keys.insert(peer, key);
            }
            debug!("loaded {} peer key(s) from {}", keys.len(), path.display());
        }

        Ok(Self { path, keys })
    }

    /// Whether a key is known for `peer`.
    pub fn has_key(&self, peer: &str) -> bool {
        self.keys.contains_key(peer)
    }

    /// Store a key for `peer` and persist.
    pub fn set_key(&mut self, peer: &str, key: [u8; 32]) -> WlResult<()> {
        self.keys.insert(peer.to_string(), key);
        self.save()
    }

    /// Generate, store, and return a fresh random key for `peer`.
    pub fn generate_key(&mut self, peer: &str) -> WlResult<[u8; 32]> {
        use rand::RngCore;
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        self.set_key(peer, key)?;
        Ok(key)
    }

    /// Encrypt `plaintext` for `peer`. Returns Base64 of `iv + ciphertext`.
    pub fn encrypt(&self, peer: &str, plaintext: &[u8]) -> WlResult<String> {
        use rand::RngCore;

        let key = self.key_for(peer)?;
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let encryptor = Aes256CbcEnc::new_from_slices(key, &iv)
            .map_err(|e| WlError::Crypto(format!("cipher init failed: {e}")))?;

        // Room for PKCS7 padding.
        let mut buf = vec![0u8; plaintext.len() + 16];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        let encrypted = encryptor
            .encrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf, plaintext.len())
            .map_err(|e| WlError::Crypto(format!("encryption failed: {e}")))?;

        let mut output = Vec::with_capacity(16 + encrypted.len());
        output.extend_from_slice(&iv);
        output.extend_from_slice(encrypted);
        Ok(base64::engine::general_purpose::STANDARD.encode(&output))
    }

    /// Decrypt a Base64 `iv + ciphertext` blob from `peer`.
    pub fn decrypt(&self, peer: &str, ciphertext: &str) -> WlResult<Vec<u8>> {
        let key = self.key_for(peer)?;
        let raw = base64::engine::general_purpose::STANDARD
            .decode(ciphertext)
            .map_err(|e| WlError::Crypto(format!("base64 decode failed: {e}")))?;

        if raw.len() < 16 {
            return Err(WlError::Crypto("ciphertext too short".into()));
        }
        let (iv, body) = raw.split_at(16);

        let decryptor = Aes256CbcDec::new_from_slices(key, iv)
            .map_err(|e| WlError::Crypto(format!("cipher init failed: {e}")))?;

        let mut buf = body.to_vec();
        let decrypted = decryptor
            .decrypt_padded_mut::<cbc::cipher::block_padding::Pkcs7>(&mut buf)
            .map_err(|e| WlError::Crypto(format!("decryption failed: {e}")))?;
        Ok(decrypted.to_vec())
    }

    fn key_for(&self, peer: &str) -> WlResult<&[u8; 32]> {
        self.keys
            .get(peer)
            .ok_or_else(|| WlError::Crypto(format!("no key for peer {peer}")))
    }

    fn save(&self) -> WlResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = KeyStoreFile {
            version: KEY_STORE_VERSION,
            keys: self
                .keys
                .iter()
                .map(|(peer, key)| {
                    (
                        peer.clone(),
                        base64::engine::general_purpose::STANDARD.encode(key),
                    )
                })
                .collect(),
        };
        let contents = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}
