//! EIP-191 style signatures over 32-byte digests.
//!
//! signed = keccak256("\x19Ethereum Signed Message:\n32" || digest)

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use sha3::{Digest, Keccak256};
use vrelay_types::{Address, Hash32, RecoverableSignature, RelayError, Result};

use crate::keys::{address_of, KeyPair};

const EIP191_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

fn prefixed_hasher(digest: &Hash32) -> Keccak256 {
    let mut hasher = Keccak256::new();
    hasher.update(EIP191_PREFIX);
    hasher.update(digest.as_bytes());
    hasher
}

/// Sign a digest, returning `r || s || v`.
pub fn sign_digest(key: &KeyPair, digest: &Hash32) -> Result<RecoverableSignature> {
    let (signature, rec_id) = key
        .signing_key()
        .sign_digest_recoverable(prefixed_hasher(digest))
        .map_err(|e| RelayError::Crypto(format!("signing failed: {}", e)))?;

    let mut out = [0u8; 65];
    out[..64].copy_from_slice(&signature.to_bytes());
    out[64] = rec_id.to_byte();
    Ok(RecoverableSignature(out))
}

/// Recover the address that produced `signature` over `digest`.
pub fn recover_signer(digest: &Hash32, signature: &RecoverableSignature) -> Result<Address> {
    let bytes = signature.as_bytes();
    let sig = Signature::from_slice(&bytes[..64])
        .map_err(|e| RelayError::Crypto(format!("malformed signature: {}", e)))?;
    let rec_id = RecoveryId::from_byte(bytes[64])
        .ok_or_else(|| RelayError::Crypto(format!("invalid recovery id {}", bytes[64])))?;

    let key = VerifyingKey::recover_from_digest(prefixed_hasher(digest), &sig, rec_id)
        .map_err(|e| RelayError::Crypto(format!("signature recovery failed: {}", e)))?;
    Ok(address_of(&key))
}

/// Check that `signature` over `digest` was produced by `expected`.
pub fn verify_signer(
    digest: &Hash32,
    signature: &RecoverableSignature,
    expected: &Address,
) -> Result<()> {
    let recovered = recover_signer(digest, signature)?;
    if recovered != *expected {
        return Err(RelayError::Authorization(format!(
            "signature recovers to {}, expected {}",
            recovered, expected
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::keccak256;

    fn key() -> KeyPair {
        KeyPair::from_seed("signature test seed 0001", None).unwrap()
    }

    #[test]
    fn test_sign_and_recover() {
        let kp = key();
        let digest = keccak256(b"voucher");
        let sig = sign_digest(&kp, &digest).unwrap();
        assert!(sig.recovery_id() <= 1);
        assert_eq!(recover_signer(&digest, &sig).unwrap(), kp.address());
        verify_signer(&digest, &sig, &kp.address()).unwrap();
    }

    #[test]
    fn test_other_digest_recovers_other_address() {
        let kp = key();
        let sig = sign_digest(&kp, &keccak256(b"a")).unwrap();
        let err = verify_signer(&keccak256(b"b"), &sig, &kp.address());
        assert!(err.is_err());
    }

    #[test]
    fn test_bad_recovery_id_rejected() {
        let kp = key();
        let digest = keccak256(b"voucher");
        let mut sig = sign_digest(&kp, &digest).unwrap();
        sig.0[64] = 7;
        assert!(matches!(
            recover_signer(&digest, &sig),
            Err(RelayError::Crypto(_))
        ));
    }
}
