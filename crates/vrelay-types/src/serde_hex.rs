//! `#[serde(with = "vrelay_types::serde_hex")]` for `Vec<u8>` fields.

use serde::{de, Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&crate::bytes_to_hex(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    crate::hex_to_bytes(&s).map_err(de::Error::custom)
}
