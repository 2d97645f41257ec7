use secp256k1::{ecdsa::Signature, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::crypto::key_management::KeyProvider;
use crate::error::{LedgerError, LedgerResult};

/// Low-level ECDSA over secp256k1 with SHA-256 message digests
pub struct SignatureManager {
    secp: Secp256k1<secp256k1::All>,
}

impl SignatureManager {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn digest(message: &[u8]) -> LedgerResult<secp256k1::Message> {
        let message_hash = Sha256::digest(message);
        secp256k1::Message::from_digest_slice(&message_hash)
            .map_err(|e| LedgerError::CryptoError(format!("Invalid message hash: {}", e)))
    }

    pub fn create_signature(
        &self,
        message: &[u8],
        secret_key: &SecretKey,
    ) -> LedgerResult<Signature> {
        let message_hash = Self::digest(message)?;
        Ok(self.secp.sign_ecdsa(&message_hash, secret_key))
    }

    pub fn verify_signature(
        &self,
        message: &[u8],
        signature: &Signature,
        public_key: &PublicKey,
    ) -> bool {
        match Self::digest(message) {
            Ok(message_hash) => self
                .secp
                .verify_ecdsa(&message_hash, signature, public_key)
                .is_ok(),
            Err(_) => false,
        }
    }

    pub fn public_key_from_secret(&self, secret_key: &SecretKey) -> PublicKey {
        PublicKey::from_secret_key(&self.secp, secret_key)
    }

    /// Generate a new keypair
    pub fn generate_keypair(&self) -> (SecretKey, PublicKey) {
        let secret_key = SecretKey::new(&mut rand::rngs::OsRng);
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
        (secret_key, public_key)
    }
}

impl Default for SignatureManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Produces block signatures with whichever key is currently active
#[derive(Clone)]
pub struct Signer {
    keys: Arc<dyn KeyProvider>,
    signatures: Arc<SignatureManager>,
}

impl Signer {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            keys,
            signatures: Arc::new(SignatureManager::new()),
        }
    }

    /// Sign with the active key, returning `(signature_hex, key_id)`.
    ///
    /// Fails with `SigningKeyUnavailable` when no usable active key exists;
    /// the ledger never records unsigned blocks.
    pub fn sign(&self, message: &[u8]) -> LedgerResult<(String, String)> {
        let key_id = self.keys.current_key_id()?;
        let signature = self.sign_with(message, &key_id)?;
        Ok((signature, key_id))
    }

    pub fn sign_with(&self, message: &[u8], key_id: &str) -> LedgerResult<String> {
        let secret_key = self.keys.signing_key(key_id)?;
        let signature = self.signatures.create_signature(message, &secret_key)?;
        debug!("Signed {} bytes with key {}", message.len(), key_id);
        Ok(hex::encode(signature.serialize_compact()))
    }
}

/// Checks block signatures against every key the provider still trusts.
///
/// Failures are reported as `false`, never as errors, so a chain walk can
/// keep going past a bad block.
#[derive(Clone)]
pub struct Verifier {
    keys: Arc<dyn KeyProvider>,
    signatures: Arc<SignatureManager>,
}

impl Verifier {
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            keys,
            signatures: Arc::new(SignatureManager::new()),
        }
    }

    pub fn verify(&self, message: &[u8], signature_hex: &str, key_id: &str) -> bool {
        let Some(public_key) = self.keys.public_key(key_id) else {
            debug!("No trusted public key for {}", key_id);
            return false;
        };

        let signature = match hex::decode(signature_hex)
            .ok()
            .and_then(|raw| Signature::from_compact(&raw).ok())
        {
            Some(sig) => sig,
            None => return false,
        };

        self.signatures
            .verify_signature(message, &signature, &public_key)
    }
}
