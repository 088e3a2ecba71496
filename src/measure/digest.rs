//! Fixed-size measurement digest (SHA3-512)

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha3::{Digest as _, Sha3_512};
use std::fmt;

/// Size of every measurement, history and platform digest in bytes
pub const MD_SIZE: usize = 64;

/// Hash function used for every measurement in the monitor
pub(crate) type MeasurementHash = Sha3_512;

/// A measurement digest: enclave measurement, hash history or platform digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; MD_SIZE]);

impl Digest {
    pub const fn from_bytes(bytes: [u8; MD_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice, which must be exactly `MD_SIZE` bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; MD_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid digest hex: {}", e))?;
        Self::from_slice(&bytes)
            .ok_or_else(|| format!("digest must be {} bytes, got {}", MD_SIZE, bytes.len()))
    }

    pub fn as_bytes(&self) -> &[u8; MD_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short prefix for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    /// Hash a sequence of byte strings into a digest
    pub(crate) fn of_parts(parts: &[&[u8]]) -> Self {
        let mut h = MeasurementHash::new();
        for part in parts {
            h.update(part);
        }
        Self::from_hasher(h)
    }

    pub(crate) fn from_hasher(h: MeasurementHash) -> Self {
        let mut out = [0u8; MD_SIZE];
        out.copy_from_slice(&h.finalize());
        Self(out)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}…)", self.short())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Digest::from_hex(&s).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip_and_length_check() {
        let d = Digest::of_parts(&[b"abc"]);
        assert_eq!(Digest::from_hex(&d.to_hex()).unwrap(), d);
        assert!(Digest::from_hex("abcd").is_err());
        assert!(Digest::from_hex("zz").is_err());
    }

    #[test]
    fn test_sha3_512_known_answer() {
        assert_eq!(
            Digest::of_parts(&[b"abc"]).to_hex(),
            "b751850b1a57168a5693cd924b6b096e08f621827444f70d884f5d0240d2712e\
             10e116e9192af3c91a7ec57647e3934057340b4cf408d5a56592f8274eec53f0"
        );
    }

    #[test]
    fn test_parts_equal_concatenation() {
        let split = Digest::of_parts(&[b"ab", b"c"]);
        let joined = Digest::of_parts(&[b"abc"]);
        assert_eq!(split, joined);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let d = Digest::of_parts(&[b"x"]);
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, format!("\"{}\"", d.to_hex()));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
