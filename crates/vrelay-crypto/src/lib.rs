//! Hashing, identifier derivation and secp256k1 signatures for the voucher relay.

pub mod encoding;
pub mod ids;
pub mod keys;
pub mod signature;

pub use encoding::{keccak256, Encoder};
pub use keys::KeyPair;
pub use signature::{recover_signer, sign_digest, verify_signer};
