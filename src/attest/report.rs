//! Attestation report — signed value object and its wire form
//!
//! Wire layout (little endian lengths):
//!
//! ```text
//! digest[64] ‖ hash_history[64] ‖ log_count u32 ‖ log_count × descriptor[272]
//!   ‖ platform_digest[64] ‖ signature[64] ‖ data_len u32 ‖ data[data_len]
//! ```
//!
//! The signature covers every other field, in wire order, including the
//! data section and both length prefixes.

use super::signer::DeviceKey;
use crate::measure::{Digest, MD_SIZE};
use crate::monitor::{PeerDescriptor, PEER_DESCRIPTOR_LEN};
use serde::{Deserialize, Serialize};

/// Size of an ed25519 signature
pub const SIGNATURE_LEN: usize = 64;

/// Smallest well-formed report: empty log, empty data section
pub const MIN_REPORT_LEN: usize = MD_SIZE * 3 + SIGNATURE_LEN + 4 + 4;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("Malformed report: {0}")]
    Malformed(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Signed attestation of one enclave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub(crate) digest: Digest,
    pub(crate) hash_history: Digest,
    pub(crate) connection_log: Vec<PeerDescriptor>,
    pub(crate) platform_digest: Digest,
    #[serde(with = "hex_signature")]
    pub(crate) signature: [u8; SIGNATURE_LEN],
    #[serde(with = "hex::serde")]
    pub(crate) data: Vec<u8>,
}

impl Report {
    /// Build and sign a report
    pub(crate) fn assemble(
        digest: Digest,
        hash_history: Digest,
        connection_log: Vec<PeerDescriptor>,
        platform_digest: Digest,
        data: Vec<u8>,
        key: &DeviceKey,
    ) -> Self {
        let mut report = Self {
            digest,
            hash_history,
            connection_log,
            platform_digest,
            signature: [0u8; SIGNATURE_LEN],
            data,
        };
        report.signature = key.sign(&report.signed_message());
        report
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn hash_history(&self) -> &Digest {
        &self.hash_history
    }

    pub fn connection_log(&self) -> &[PeerDescriptor] {
        &self.connection_log
    }

    pub fn platform_digest(&self) -> &Digest {
        &self.platform_digest
    }

    pub fn signature(&self) -> &[u8; SIGNATURE_LEN] {
        &self.signature
    }

    /// Echoed data section (challenge nonce)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Bytes covered by the signature
    pub fn signed_message(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_body(&mut out);
        self.encode_data(&mut out);
        out
    }

    fn encoded_len(&self) -> usize {
        MIN_REPORT_LEN + self.connection_log.len() * PEER_DESCRIPTOR_LEN + self.data.len()
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.digest.as_bytes());
        out.extend_from_slice(self.hash_history.as_bytes());
        out.extend_from_slice(&(self.connection_log.len() as u32).to_le_bytes());
        for entry in &self.connection_log {
            entry.encode(out);
        }
        out.extend_from_slice(self.platform_digest.as_bytes());
    }

    fn encode_data(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_body(&mut out);
        out.extend_from_slice(&self.signature);
        self.encode_data(&mut out);
        out
    }

    /// Decode a report. Any size mismatch is a hard error.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReportError> {
        if bytes.len() < MIN_REPORT_LEN {
            return Err(ReportError::Malformed(format!(
                "{} bytes is shorter than the minimum report size {}",
                bytes.len(),
                MIN_REPORT_LEN
            )));
        }
        let mut r = Reader { bytes, pos: 0 };

        let digest = r.digest("digest")?;
        let hash_history = r.digest("hash history")?;
        let count = r.u32("connection log count")? as usize;
        let log_bytes = count
            .checked_mul(PEER_DESCRIPTOR_LEN)
            .filter(|&n| n <= r.remaining())
            .ok_or_else(|| {
                ReportError::Malformed(format!(
                    "connection log claims {} entries, only {} bytes remain",
                    count,
                    r.remaining()
                ))
            })?;
        let connection_log = r
            .take(log_bytes, "connection log")?
            .chunks_exact(PEER_DESCRIPTOR_LEN)
            .map(PeerDescriptor::decode)
            .collect::<Result<Vec<_>, _>>()
            .map_err(ReportError::Malformed)?;
        let platform_digest = r.digest("platform digest")?;
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(r.take(SIGNATURE_LEN, "signature")?);
        let data_len = r.u32("data length")? as usize;
        let data = r.take(data_len, "data section")?.to_vec();

        if r.remaining() != 0 {
            return Err(ReportError::Malformed(format!(
                "{} trailing bytes after data section",
                r.remaining()
            )));
        }

        Ok(Self {
            digest,
            hash_history,
            connection_log,
            platform_digest,
            signature,
            data,
        })
    }

    pub fn to_json(&self) -> Result<String, ReportError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse the JSON form. Well-formed JSON with out-of-range fields is
    /// `Malformed`, like its binary counterpart.
    pub fn from_json(json: &str) -> Result<Self, ReportError> {
        serde_json::from_str(json).map_err(|e| {
            if e.is_data() {
                ReportError::Malformed(e.to_string())
            } else {
                ReportError::Json(e)
            }
        })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], ReportError> {
        if n > self.remaining() {
            return Err(ReportError::Malformed(format!(
                "{} needs {} bytes, only {} remain",
                field,
                n,
                self.remaining()
            )));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn digest(&mut self, field: &str) -> Result<Digest, ReportError> {
        let bytes = self.take(MD_SIZE, field)?;
        Digest::from_slice(bytes).ok_or_else(|| ReportError::Malformed(format!("bad {}", field)))
    }

    fn u32(&mut self, field: &str) -> Result<u32, ReportError> {
        let b = self.take(4, field)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

mod hex_signature {
    use super::SIGNATURE_LEN;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; SIGNATURE_LEN], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(sig))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; SIGNATURE_LEN], D::Error> {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(&s).map_err(D::Error::custom)?;
        bytes
            .try_into()
            .map_err(|b: Vec<u8>| D::Error::custom(format!("signature must be 64 bytes, got {}", b.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::ConnectionEvent;
    use crate::monitor::EnclaveId;

    fn sample() -> Report {
        let peer = PeerDescriptor::new(
            EnclaveId::from_parts(1, 1),
            ConnectionEvent::Connect,
            "/apps/actuator.eapp",
        )
        .unwrap();
        Report::assemble(
            Digest::from_bytes([1u8; MD_SIZE]),
            Digest::from_bytes([2u8; MD_SIZE]),
            vec![peer],
            Digest::from_bytes([3u8; MD_SIZE]),
            b"nonce-0001".to_vec(),
            &DeviceKey::from_bytes(&[9u8; 32]),
        )
    }

    #[test]
    fn test_wire_layout() {
        let report = sample();
        let bytes = report.to_bytes();
        assert_eq!(bytes.len(), MIN_REPORT_LEN + PEER_DESCRIPTOR_LEN + 10);
        assert_eq!(&bytes[..MD_SIZE], &[1u8; MD_SIZE]);
        assert_eq!(&bytes[128..132], &1u32.to_le_bytes());

        let sig_at = 132 + PEER_DESCRIPTOR_LEN + MD_SIZE;
        assert_eq!(&bytes[sig_at..sig_at + SIGNATURE_LEN], report.signature());
        assert_eq!(&bytes[bytes.len() - 10..], b"nonce-0001");

        assert_eq!(Report::from_bytes(&bytes).unwrap(), report);
    }

    #[test]
    fn test_signed_message_excludes_signature() {
        let report = sample();
        let msg = report.signed_message();
        assert_eq!(msg.len(), report.to_bytes().len() - SIGNATURE_LEN);
        assert!(msg.ends_with(b"nonce-0001"));
    }

    #[test]
    fn test_truncated_input_is_malformed() {
        let bytes = sample().to_bytes();
        for len in [0, 10, MIN_REPORT_LEN - 1, bytes.len() - 1] {
            assert!(matches!(
                Report::from_bytes(&bytes[..len]),
                Err(ReportError::Malformed(_))
            ));
        }

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(Report::from_bytes(&trailing).is_err());
    }

    #[test]
    fn test_oversized_log_count_is_malformed() {
        let mut bytes = sample().to_bytes();
        bytes[128..132].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(Report::from_bytes(&bytes), Err(ReportError::Malformed(_))));
    }

    #[test]
    fn test_json_form() {
        let report = sample();
        let json = report.to_json().unwrap();
        assert!(json.contains(&hex::encode(b"nonce-0001")));
        assert_eq!(Report::from_json(&json).unwrap(), report);
        assert!(matches!(Report::from_json("{"), Err(ReportError::Json(_))));
        assert!(matches!(Report::from_json("{}"), Err(ReportError::Malformed(_))));
    }

    #[test]
    fn test_json_oversized_reference_is_malformed() {
        let json = sample()
            .to_json()
            .unwrap()
            .replace("/apps/actuator.eapp", &"x".repeat(400));
        assert!(matches!(Report::from_json(&json), Err(ReportError::Malformed(_))));
    }
}
