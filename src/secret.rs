//! Secret and hash-lock generation
//!
//! One hash function is fixed per deployment and must be the one the deployed
//! HTLC contracts verify. A secret generated under one function never validates
//! under the other, so [`Commitments`] carries the function with it.

use crate::types::bytes32_newtype;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use std::fmt;

bytes32_newtype!(
    /// Public commitment to a secret
    HashLock
);

/// Hash function used to derive hash locks from secrets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    Keccak256,
    Sha256,
}

impl Default for HashFunction {
    fn default() -> Self {
        HashFunction::Keccak256
    }
}

impl HashFunction {
    pub fn digest(&self, data: &[u8]) -> [u8; 32] {
        match self {
            HashFunction::Keccak256 => Keccak256::digest(data).into(),
            HashFunction::Sha256 => Sha256::digest(data).into(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashFunction::Keccak256 => "keccak256",
            HashFunction::Sha256 => "sha256",
        }
    }
}

/// 256-bit swap preimage
///
/// Not `Serialize` and redacted in `Debug`; it leaves its holder
/// only as a withdrawal argument.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Secret(bytes)
    }

    pub fn from_hex(input: &str) -> Result<Self, String> {
        crate::types::decode_hex32(input).map(Secret)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex form, for passing to a ledger or persisting in the owner's store
    pub fn expose_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Commitment manager bound to the deployment's hash function
#[derive(Debug, Clone, Copy)]
pub struct Commitments {
    hash_function: HashFunction,
}

impl Commitments {
    pub fn new(hash_function: HashFunction) -> Self {
        Self { hash_function }
    }

    pub fn hash_function(&self) -> HashFunction {
        self.hash_function
    }

    /// Generate a fresh secret and its hash lock
    pub fn generate(&self) -> (Secret, HashLock) {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let secret = Secret(bytes);
        let lock = self.hash_lock(&secret);
        (secret, lock)
    }

    pub fn hash_lock(&self, secret: &Secret) -> HashLock {
        HashLock(self.hash_function.digest(&secret.0))
    }

    pub fn verify(&self, secret: &Secret, lock: &HashLock) -> bool {
        self.hash_lock(secret) == *lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_verifies() {
        let commitments = Commitments::new(HashFunction::Keccak256);
        let (secret, lock) = commitments.generate();
        assert!(commitments.verify(&secret, &lock));

        let (other, _) = commitments.generate();
        assert!(!commitments.verify(&other, &lock));
    }

    #[test]
    fn test_functions_do_not_cross_validate() {
        let keccak = Commitments::new(HashFunction::Keccak256);
        let sha = Commitments::new(HashFunction::Sha256);
        let (secret, lock) = keccak.generate();
        assert!(!sha.verify(&secret, &lock));
    }

    #[test]
    fn test_known_keccak_vector() {
        // keccak256 of 32 zero bytes
        let lock = Commitments::new(HashFunction::Keccak256).hash_lock(&Secret([0u8; 32]));
        assert_eq!(
            lock.to_hex(),
            "0x290decd9548b62a8d60345a988386fc84ba6bc95484008f6362f93160ef3e563"
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", secret), "Secret(<redacted>)");
    }
}
