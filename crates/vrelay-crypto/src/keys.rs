//! secp256k1 key derivation via HKDF-SHA256.
//!
//! Flow: seed → HKDF-SHA256 (info "VRelay.KeyGen[:nonce]") → secp256k1 scalar → keypair
//!
//! Addresses are the last 20 bytes of keccak256 of the uncompressed public key
//! without its 0x04 prefix.

use hkdf::Hkdf;
use k256::ecdsa::{SigningKey, VerifyingKey};
use sha2::Sha256;
use vrelay_types::{Address, RelayError, Result};

use crate::encoding::keccak256;

const HKDF_INFO: &str = "VRelay.KeyGen";

/// Derive 32 bytes of key material from a seed.
fn derive_seed(seed: &str, nonce: Option<&str>, counter: u8) -> Result<[u8; 32]> {
    if seed.len() < 16 {
        return Err(RelayError::Crypto(
            "seed too short: minimum 16 characters required".into(),
        ));
    }

    let info = match nonce {
        Some(n) => format!("{}:{}", HKDF_INFO, n),
        None => HKDF_INFO.to_string(),
    };

    let hk = Hkdf::<Sha256>::new(Some(&[counter]), seed.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(info.as_bytes(), &mut okm)
        .map_err(|e| RelayError::Crypto(format!("key derivation failed: {}", e)))?;

    Ok(okm)
}

/// Address for a verifying key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash.as_bytes()[12..]);
    Address(out)
}

/// A signing key together with its address.
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    /// Derive a key pair from a seed string and optional nonce.
    pub fn from_seed(seed: &str, nonce: Option<&str>) -> Result<Self> {
        // An out-of-range scalar is astronomically unlikely; retry with a new salt.
        for counter in 0..=u8::MAX {
            let bytes = derive_seed(seed, nonce, counter)?;
            if let Ok(signing_key) = SigningKey::from_slice(&bytes) {
                return Ok(Self::from_signing_key(signing_key));
            }
        }
        Err(RelayError::Crypto("no valid scalar derived from seed".into()))
    }

    /// Load a key pair from a raw 32-byte secret.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_slice(secret)
            .map_err(|e| RelayError::Crypto(format!("invalid secret key: {}", e)))?;
        Ok(Self::from_signing_key(signing_key))
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let address = address_of(signing_key.verifying_key());
        Self {
            signing_key,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }
}
