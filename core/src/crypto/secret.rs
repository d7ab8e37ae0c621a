//! Per-pair shared secret and AES-256-GCM payload sealing
//!
//! The secret is held as raw bytes rather than a live cipher so the trust
//! store can round-trip it across restarts. Wire form of a sealed payload
//! is `nonce || ciphertext`; the nonce is never reused because it is drawn
//! fresh from the OS RNG for every seal.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::protocol::constants::SECRET_INFO;
use crate::{Error, Result};

const NONCE_LEN: usize = 12;

/// Symmetric secret shared with exactly one paired peer.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret {
    key: [u8; 32],
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSecret").finish_non_exhaustive()
    }
}

impl SharedSecret {
    /// Derive from an ECDH agreement: `SHA256(ecdh || SECRET_INFO)`.
    pub fn derive(ecdh: &x25519_dalek::SharedSecret) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ecdh.as_bytes());
        hasher.update(SECRET_INFO);
        Self {
            key: hasher.finalize().into(),
        }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.key
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new_from_slice(&self.key).expect("32 bytes is a valid AES-256 key")
    }

    /// Encrypt a payload body; output is `nonce || ciphertext`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher()
            .encrypt(nonce, plaintext)
            .map_err(|e| Error::Crypto(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    /// Decrypt a sealed payload. Fails on truncation, tampering, or a
    /// payload sealed under any other peer's secret.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() <= NONCE_LEN {
            return Err(Error::Crypto("sealed payload too short".to_string()));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
        self.cipher()
            .decrypt(nonce, &sealed[NONCE_LEN..])
            .map_err(|e| Error::Crypto(format!("decryption failed: {e}")))
    }
}

impl Serialize for SharedSecret {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&BASE64.encode(self.key))
    }
}

impl<'de> Deserialize<'de> for SharedSecret {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let bytes = BASE64.decode(&s).map_err(serde::de::Error::custom)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid secret length"))?;
        Ok(Self { key })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EphemeralSecret;

    fn pair_of_secrets() -> (SharedSecret, SharedSecret) {
        let a = EphemeralSecret::generate();
        let b = EphemeralSecret::generate();
        let a_pub = a.public_key();
        let b_pub = b.public_key();
        (
            SharedSecret::derive(&a.diffie_hellman(&b_pub)),
            SharedSecret::derive(&b.diffie_hellman(&a_pub)),
        )
    }

    #[test]
    fn seal_open_roundtrip() {
        let (ours, theirs) = pair_of_secrets();
        assert_eq!(ours, theirs);

        let plaintext = br#"{"type":"ICON_REQUEST","packageName":"com.example.app"}"#;
        let sealed = ours.seal(plaintext).unwrap();
        assert_eq!(theirs.open(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn wrong_secret_fails_not_garbage() {
        let (ours, _) = pair_of_secrets();
        let (other, _) = pair_of_secrets();

        let sealed = ours.seal(b"secret message").unwrap();
        assert!(other.open(&sealed).is_err());
    }

    #[test]
    fn nonces_differ_per_seal() {
        let (secret, _) = pair_of_secrets();
        let a = secret.seal(b"same").unwrap();
        let b = secret.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn truncated_payload_rejected() {
        let (secret, _) = pair_of_secrets();
        assert!(secret.open(&[0u8; 8]).is_err());
    }

    #[test]
    fn serde_roundtrip_preserves_key() {
        let (secret, _) = pair_of_secrets();
        let json = serde_json::to_string(&secret).unwrap();
        let restored: SharedSecret = serde_json::from_str(&json).unwrap();
        let sealed = secret.seal(b"persisted").unwrap();
        assert_eq!(restored.open(&sealed).unwrap(), b"persisted");
    }
}
