//! Device identity and key-exchange primitives

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{
    Signature, Signer, SigningKey as Ed25519SigningKey, Verifier,
    VerifyingKey as Ed25519VerifyingKey,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret as X25519Secret, PublicKey as X25519Public};

use crate::{Error, Result};

/// Ed25519 signing key: the long-lived device identity.
#[derive(Clone)]
pub struct SigningKey {
    inner: Ed25519SigningKey,
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("public", &self.fingerprint())
            .finish()
    }
}

impl SigningKey {
    pub fn generate() -> Self {
        Self {
            inner: Ed25519SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            inner: Ed25519SigningKey::from_bytes(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.inner.sign(message).to_bytes().to_vec()
    }

    /// Fingerprint of the public half, for display and pairing confirmation.
    pub fn fingerprint(&self) -> String {
        self.verifying_key().fingerprint()
    }
}

/// Ed25519 verifying (public) key of a device.
#[derive(Clone)]
pub struct VerifyingKey {
    inner: Ed25519VerifyingKey,
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VerifyingKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

impl VerifyingKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        Ok(Self {
            inner: Ed25519VerifyingKey::from_bytes(bytes)
                .map_err(|e| Error::Crypto(e.to_string()))?,
        })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| Error::Crypto("invalid signature length".to_string()))?;
        let sig = Signature::from_bytes(&sig_bytes);
        self.inner
            .verify(message, &sig)
            .map_err(|e| Error::Crypto(e.to_string()))
    }

    /// First 8 bytes of SHA-256 over the key, base64.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.inner.as_bytes());
        let hash = hasher.finalize();
        BASE64.encode(&hash[..8])
    }
}

/// X25519 ephemeral secret, consumed by one pairing exchange.
pub struct EphemeralSecret {
    inner: X25519Secret,
}

impl EphemeralSecret {
    pub fn generate() -> Self {
        Self {
            inner: X25519Secret::random_from_rng(OsRng),
        }
    }

    pub fn public_key(&self) -> ExchangeKey {
        ExchangeKey {
            inner: X25519Public::from(&self.inner),
        }
    }

    pub fn diffie_hellman(self, their_public: &ExchangeKey) -> x25519_dalek::SharedSecret {
        self.inner.diffie_hellman(&their_public.inner)
    }
}

/// X25519 public key sent in a hello frame.
#[derive(Clone)]
pub struct ExchangeKey {
    inner: X25519Public,
}

impl std::fmt::Debug for ExchangeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKey")
            .field("bytes", &BASE64.encode(self.inner.as_bytes()))
            .finish()
    }
}

impl ExchangeKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            inner: X25519Public::from(bytes),
        }
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        *self.inner.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_roundtrip() {
        let key = SigningKey::generate();
        let message = b"pairing transcript";
        let signature = key.sign(message);
        assert!(key.verifying_key().verify(message, &signature).is_ok());
    }

    #[test]
    fn tampered_message_fails_verification() {
        let key = SigningKey::generate();
        let signature = key.sign(b"original");
        assert!(key.verifying_key().verify(b"tampered", &signature).is_err());
    }

    #[test]
    fn ecdh_agrees() {
        let a = EphemeralSecret::generate();
        let b = EphemeralSecret::generate();
        let a_pub = a.public_key();
        let b_pub = b.public_key();
        let a_shared = a.diffie_hellman(&b_pub);
        let b_shared = b.diffie_hellman(&a_pub);
        assert_eq!(a_shared.as_bytes(), b_shared.as_bytes());
    }

    #[test]
    fn signing_key_bytes_roundtrip() {
        let key = SigningKey::generate();
        let restored = SigningKey::from_bytes(&key.to_bytes());
        assert_eq!(key.fingerprint(), restored.fingerprint());
    }
}
