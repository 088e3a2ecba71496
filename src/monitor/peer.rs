//! Connection log — bounded, append-only record of peer events
//!
//! Each entry names the peer and the image reference a verifier uses to
//! re-measure it. Entries have a fixed wire size so reports can carry them
//! byte for byte.

use super::registry::EnclaveId;
use crate::measure::ConnectionEvent;
use serde::{Deserialize, Serialize};

/// Maximum bytes of an image reference (one byte stays NUL)
pub const REFERENCE_MAX: usize = 255;

const REFERENCE_FIELD: usize = REFERENCE_MAX + 1;
const RESERVED: usize = 7;

/// Encoded size of one `PeerDescriptor`
pub const PEER_DESCRIPTOR_LEN: usize = 4 + 4 + 1 + RESERVED + REFERENCE_FIELD;

/// One connect or disconnect event, as seen from the logging enclave.
///
/// The reference always passes `check_reference`, whichever way the
/// descriptor was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedDescriptor")]
pub struct PeerDescriptor {
    peer: EnclaveId,
    event: ConnectionEvent,
    /// Reference to the peer's application artifact
    reference: String,
}

#[derive(Deserialize)]
struct UncheckedDescriptor {
    peer: EnclaveId,
    event: ConnectionEvent,
    reference: String,
}

impl TryFrom<UncheckedDescriptor> for PeerDescriptor {
    type Error = String;

    fn try_from(raw: UncheckedDescriptor) -> Result<Self, String> {
        Self::new(raw.peer, raw.event, raw.reference)
    }
}

impl PeerDescriptor {
    pub fn new(
        peer: EnclaveId,
        event: ConnectionEvent,
        reference: impl Into<String>,
    ) -> Result<Self, String> {
        let reference = reference.into();
        check_reference(&reference)?;
        Ok(Self {
            peer,
            event,
            reference,
        })
    }

    pub fn peer(&self) -> EnclaveId {
        self.peer
    }

    pub fn event(&self) -> ConnectionEvent {
        self.event
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.peer.index().to_le_bytes());
        out.extend_from_slice(&self.peer.generation().to_le_bytes());
        out.push(self.event.code());
        out.extend_from_slice(&[0u8; RESERVED]);
        let mut field = [0u8; REFERENCE_FIELD];
        field[..self.reference.len()].copy_from_slice(self.reference.as_bytes());
        out.extend_from_slice(&field);
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != PEER_DESCRIPTOR_LEN {
            return Err(format!(
                "peer descriptor must be {} bytes, got {}",
                PEER_DESCRIPTOR_LEN,
                bytes.len()
            ));
        }
        let word = |at: usize| u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
        let peer = EnclaveId::from_parts(word(0), word(4));
        let event = ConnectionEvent::from_code(bytes[8])
            .ok_or_else(|| format!("unknown connection event code {}", bytes[8]))?;

        let field = &bytes[8 + 1 + RESERVED..];
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        if end > REFERENCE_MAX {
            return Err("image reference is not NUL terminated".into());
        }
        let reference = std::str::from_utf8(&field[..end])
            .map_err(|e| format!("image reference is not UTF-8: {}", e))?;
        Self::new(peer, event, reference)
    }
}

/// Validate an image reference for use in a peer descriptor
pub fn check_reference(reference: &str) -> Result<(), String> {
    if reference.len() > REFERENCE_MAX {
        return Err(format!(
            "image reference is {} bytes, limit is {}",
            reference.len(),
            REFERENCE_MAX
        ));
    }
    if reference.as_bytes().contains(&0) {
        return Err("image reference contains a NUL byte".into());
    }
    Ok(())
}

/// Ordered, bounded sequence of peer descriptors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLog {
    capacity: usize,
    entries: Vec<PeerDescriptor>,
}

impl ConnectionLog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn entries(&self) -> &[PeerDescriptor] {
        &self.entries
    }

    /// Append an entry; a full log rejects the entry and returns it
    pub fn push(&mut self, entry: PeerDescriptor) -> Result<(), PeerDescriptor> {
        if self.is_full() {
            return Err(entry);
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Drop the newest entry of a connection event that did not complete
    pub(crate) fn undo_last(&mut self) {
        self.entries.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_wire_form() {
        let d = PeerDescriptor::new(
            EnclaveId::from_parts(3, 7),
            ConnectionEvent::Disconnect,
            "/apps/peripheral.eapp",
        )
        .unwrap();
        let mut buf = Vec::new();
        d.encode(&mut buf);
        assert_eq!(buf.len(), PEER_DESCRIPTOR_LEN);
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
        assert_eq!(buf[8], 2);
        assert_eq!(PeerDescriptor::decode(&buf).unwrap(), d);
    }

    #[test]
    fn test_descriptor_rejects_bad_input() {
        assert!(PeerDescriptor::decode(&[0u8; 10]).is_err());

        let mut bad_event = vec![0u8; PEER_DESCRIPTOR_LEN];
        bad_event[8] = 9;
        assert!(PeerDescriptor::decode(&bad_event).is_err());

        let mut unterminated = vec![0u8; PEER_DESCRIPTOR_LEN];
        unterminated[8] = 1;
        for b in &mut unterminated[16..] {
            *b = b'a';
        }
        assert!(PeerDescriptor::decode(&unterminated).is_err());
    }

    #[test]
    fn test_reference_limits() {
        let id = EnclaveId::from_parts(0, 1);
        assert!(PeerDescriptor::new(id, ConnectionEvent::Connect, "a".repeat(REFERENCE_MAX)).is_ok());
        assert!(PeerDescriptor::new(id, ConnectionEvent::Connect, "a".repeat(REFERENCE_MAX + 1)).is_err());
        assert!(PeerDescriptor::new(id, ConnectionEvent::Connect, "a\0b").is_err());
    }

    #[test]
    fn test_deserialize_checks_reference() {
        let json = |reference: &str| {
            format!(
                r#"{{"peer":{{"index":1,"generation":1}},"event":"Connect","reference":"{}"}}"#,
                reference
            )
        };
        let ok: PeerDescriptor = serde_json::from_str(&json("/apps/a.eapp")).unwrap();
        assert_eq!(ok.reference(), "/apps/a.eapp");
        assert!(serde_json::from_str::<PeerDescriptor>(&json(&"a".repeat(400))).is_err());
        assert!(serde_json::from_str::<PeerDescriptor>(&json("a\\u0000b")).is_err());
    }

    #[test]
    fn test_log_full_rejects_instead_of_overwriting() {
        let id = EnclaveId::from_parts(1, 1);
        let mut log = ConnectionLog::with_capacity(2);
        for name in ["a", "b"] {
            log.push(PeerDescriptor::new(id, ConnectionEvent::Connect, name).unwrap())
                .unwrap();
        }
        assert!(log.is_full());
        let rejected = PeerDescriptor::new(id, ConnectionEvent::Connect, "c").unwrap();
        assert_eq!(log.push(rejected.clone()), Err(rejected));
        let refs: Vec<&str> = log.entries().iter().map(PeerDescriptor::reference).collect();
        assert_eq!(refs, vec!["a", "b"]);
    }
}
