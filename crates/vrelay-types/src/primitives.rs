//! Fixed-width byte identifiers, serialized as 0x-prefixed hex strings.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{hex_to_bytes, RelayError};

macro_rules! fixed_bytes {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const LEN: usize = $len;
            pub const ZERO: Self = Self([0u8; $len]);

            pub fn from_slice(bytes: &[u8]) -> crate::Result<Self> {
                let arr: [u8; $len] = bytes.try_into().map_err(|_| {
                    RelayError::InvalidHex(format!(
                        "expected {} bytes for {}, got {}",
                        $len,
                        stringify!($name),
                        bytes.len()
                    ))
                })?;
                Ok(Self(arr))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }

            pub fn to_hex(&self) -> String {
                crate::bytes_to_hex(&self.0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::ZERO
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.to_hex())
            }
        }

        impl FromStr for $name {
            type Err = RelayError;

            fn from_str(s: &str) -> crate::Result<Self> {
                Self::from_slice(&hex_to_bytes(s)?)
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(de::Error::custom)
            }
        }
    };
}

fixed_bytes!(
    /// 20-byte account address. `Address::ZERO` doubles as the native asset.
    Address,
    20
);

fixed_bytes!(
    /// 32-byte Keccak-256 digest, used for request, voucher and leaf ids.
    Hash32,
    32
);

fixed_bytes!(
    /// secp256k1 signature `r || s || v` with `v` in {0, 1}.
    RecoverableSignature,
    65
);

impl Address {
    /// Native asset marker.
    pub const NATIVE: Address = Address::ZERO;

    /// Build a readable test/demo address from a single byte.
    pub fn repeat_byte(b: u8) -> Self {
        Self([b; 20])
    }
}

impl Hash32 {
    pub fn repeat_byte(b: u8) -> Self {
        Self([b; 32])
    }
}

impl RecoverableSignature {
    pub fn recovery_id(&self) -> u8 {
        self.0[64]
    }
}
