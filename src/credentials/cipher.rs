use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};

use super::store::StoreError;

pub const TOKEN_CIPHER_KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;
const ENVELOPE_VERSION: u8 = 1;

/// AES-256-GCM sealing for credential blobs at rest.
pub struct TokenCipher {
    key: LessSafeKey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u8,
    nonce: String,
    ciphertext: String,
}

impl TokenCipher {
    pub fn new(key_bytes: &[u8; TOKEN_CIPHER_KEY_BYTES]) -> Result<Self, StoreError> {
        let unbound = UnboundKey::new(&AES_256_GCM, key_bytes)
            .map_err(|_| StoreError::Crypto("construct AES-256-GCM key".to_string()))?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Parses a 64 character hex key.
    pub fn from_hex(raw: &str) -> Result<Self, StoreError> {
        let decoded = hex::decode(raw.trim())
            .map_err(|e| StoreError::Config(format!("token cache key is not hex: {e}")))?;
        let key: [u8; TOKEN_CIPHER_KEY_BYTES] = decoded.try_into().map_err(|_| {
            StoreError::Config(format!(
                "token cache key must be {TOKEN_CIPHER_KEY_BYTES} bytes ({} hex chars)",
                TOKEN_CIPHER_KEY_BYTES * 2
            ))
        })?;
        Self::new(&key)
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, StoreError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| StoreError::Crypto("generate nonce".to_string()))?;

        let mut buffer = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut buffer,
            )
            .map_err(|_| StoreError::Crypto("seal credential".to_string()))?;

        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            nonce: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(&buffer),
        };
        Ok(serde_json::to_string(&envelope)?)
    }

    pub fn open(&self, sealed: &str) -> Result<Vec<u8>, StoreError> {
        let envelope: SealedEnvelope = serde_json::from_str(sealed)?;
        if envelope.version != ENVELOPE_VERSION {
            return Err(StoreError::Crypto(format!(
                "unsupported envelope version {}",
                envelope.version
            )));
        }

        let nonce_bytes: [u8; NONCE_BYTES] = STANDARD
            .decode(&envelope.nonce)
            .map_err(|e| StoreError::Crypto(format!("decode nonce: {e}")))?
            .try_into()
            .map_err(|_| StoreError::Crypto("invalid nonce length".to_string()))?;
        let mut ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| StoreError::Crypto(format!("decode ciphertext: {e}")))?;

        let plaintext = self
            .key
            .open_in_place(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut ciphertext,
            )
            .map_err(|_| StoreError::Crypto("open credential (wrong key?)".to_string()))?;
        Ok(plaintext.to_vec())
    }
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TokenCipher(AES-256-GCM)")
    }
}
