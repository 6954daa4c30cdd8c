// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Credential Relay Cryptography
//!
//! Ephemeral RSA-2048 keypairs for agents and RSA-OAEP (SHA-256) sealing of
//! credential values. The private half never leaves [`CredentialKeypair`];
//! only the public JWK is handed out.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Key generation, JWK export/import, OAEP encrypt/decrypt
//! - **Encoding:** ciphertext is base64url without padding

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand_core::OsRng;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::credential::PublicJwk;

pub const KEY_BITS: usize = 2048;
pub const JWK_ALG: &str = "RSA-OAEP-256";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Invalid JWK: {0}")]
    InvalidJwk(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),
}

/// Per-agent ephemeral keypair. Regenerated on every agent start.
pub struct CredentialKeypair {
    key_id: Uuid,
    private_key: RsaPrivateKey,
    public_jwk: PublicJwk,
}

impl std::fmt::Debug for CredentialKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialKeypair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl CredentialKeypair {
    pub fn generate() -> Result<Self, CryptoError> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let key_id = Uuid::new_v4();
        let public_jwk = export_jwk(&RsaPublicKey::from(&private_key), &key_id.to_string());
        Ok(Self {
            key_id,
            private_key,
            public_jwk,
        })
    }

    /// Key generation is CPU bound; run it off the async executor.
    pub async fn generate_async() -> Result<Self, CryptoError> {
        tokio::task::spawn_blocking(Self::generate)
            .await
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?
    }

    pub fn key_id(&self) -> Uuid {
        self.key_id
    }

    pub fn public_jwk(&self) -> &PublicJwk {
        &self.public_jwk
    }

    pub fn decrypt(&self, encrypted: &str) -> Result<String, CryptoError> {
        let ciphertext = URL_SAFE_NO_PAD
            .decode(encrypted.trim_end_matches('='))
            .map_err(|e| CryptoError::Decryption(format!("invalid base64url: {e}")))?;
        let plaintext = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|e| CryptoError::Decryption(e.to_string()))?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".to_string()))
    }
}

fn export_jwk(key: &RsaPublicKey, key_id: &str) -> PublicJwk {
    PublicJwk {
        kty: "RSA".to_string(),
        kid: key_id.to_string(),
        n: URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        e: URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
        alg: Some(JWK_ALG.to_string()),
        key_use: Some("enc".to_string()),
    }
}

pub fn import_jwk(jwk: &PublicJwk) -> Result<RsaPublicKey, CryptoError> {
    if jwk.kty != "RSA" {
        return Err(CryptoError::InvalidJwk(format!("unsupported kty '{}'", jwk.kty)));
    }
    let decode = |field: &str, value: &str| {
        URL_SAFE_NO_PAD
            .decode(value)
            .map_err(|e| CryptoError::InvalidJwk(format!("field '{field}': {e}")))
    };
    let n = BigUint::from_bytes_be(&decode("n", &jwk.n)?);
    let e = BigUint::from_bytes_be(&decode("e", &jwk.e)?);
    RsaPublicKey::new(n, e).map_err(|e| CryptoError::InvalidJwk(e.to_string()))
}

/// Seal `plaintext` for the holder of `jwk`'s private key.
pub fn encrypt_for(jwk: &PublicJwk, plaintext: &str) -> Result<String, CryptoError> {
    let key = import_jwk(jwk)?;
    let ciphertext = key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext.as_bytes())
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(ciphertext))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, OnceLock};

    /// Keys are slow to generate; tests share two.
    pub(crate) fn shared_keypairs() -> (Arc<CredentialKeypair>, Arc<CredentialKeypair>) {
        static KEYS: OnceLock<(Arc<CredentialKeypair>, Arc<CredentialKeypair>)> = OnceLock::new();
        KEYS.get_or_init(|| {
            (
                Arc::new(CredentialKeypair::generate().unwrap()),
                Arc::new(CredentialKeypair::generate().unwrap()),
            )
        })
        .clone()
    }

    #[test]
    fn test_round_trip() {
        let (keys, _) = shared_keypairs();
        let sealed = encrypt_for(keys.public_jwk(), "sk-live-123").unwrap();
        assert_ne!(sealed, "sk-live-123");
        assert!(!sealed.contains('='));
        assert_eq!(keys.decrypt(&sealed).unwrap(), "sk-live-123");
    }

    #[test]
    fn test_other_key_fails_to_decrypt() {
        let (keys, other) = shared_keypairs();
        let sealed = encrypt_for(other.public_jwk(), "secret").unwrap();
        assert!(matches!(keys.decrypt(&sealed), Err(CryptoError::Decryption(_))));
    }

    #[test]
    fn test_jwk_shape() {
        let (keys, _) = shared_keypairs();
        let jwk = keys.public_jwk();
        assert_eq!(jwk.kty, "RSA");
        assert_eq!(jwk.kid, keys.key_id().to_string());
        assert_eq!(jwk.alg.as_deref(), Some("RSA-OAEP-256"));
        assert_eq!(jwk.e, "AQAB");
        assert_eq!(import_jwk(jwk).unwrap().size(), KEY_BITS / 8);
    }

    #[test]
    fn test_garbage_input() {
        let (keys, _) = shared_keypairs();
        assert!(keys.decrypt("!!not base64!!").is_err());
        assert!(keys.decrypt("AAAA").is_err());

        let mut bad = keys.public_jwk().clone();
        bad.kty = "EC".to_string();
        assert!(matches!(encrypt_for(&bad, "x"), Err(CryptoError::InvalidJwk(_))));
    }
}
