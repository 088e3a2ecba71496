//! Hash history — append-only chain over connect/disconnect events
//!
//! `history' = H(history ‖ digest_peer ‖ tag)` where the tag is `"CONNECT"`
//! or `"DISCONNECT"`. Each side of a connection folds in the *peer's*
//! digest, so two connected enclaves end up with different histories.

use super::digest::Digest;
use serde::{Deserialize, Serialize};

/// Kind of event recorded in a hash history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    Connect,
    Disconnect,
}

impl ConnectionEvent {
    /// Domain tag appended to the hash input. The two tags have different lengths.
    pub fn tag(self) -> &'static [u8] {
        match self {
            ConnectionEvent::Connect => b"CONNECT",
            ConnectionEvent::Disconnect => b"DISCONNECT",
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            ConnectionEvent::Connect => 1,
            ConnectionEvent::Disconnect => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConnectionEvent::Connect),
            2 => Some(ConnectionEvent::Disconnect),
            _ => None,
        }
    }
}

/// Apply one event to a hash history
pub fn extend_history(history: &Digest, peer: &Digest, event: ConnectionEvent) -> Digest {
    Digest::of_parts(&[history.as_bytes(), peer.as_bytes(), event.tag()])
}

/// Replay a sequence of `(event, peer digest)` pairs on top of an initial digest
pub fn replay_history<I>(initial: Digest, events: I) -> Digest
where
    I: IntoIterator<Item = (ConnectionEvent, Digest)>,
{
    events
        .into_iter()
        .fold(initial, |history, (event, peer)| {
            extend_history(&history, &peer, event)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_connect_formula() {
        let d0 = Digest::of_parts(&[b"enclave-a"]);
        let d1 = Digest::of_parts(&[b"enclave-b"]);
        let after = extend_history(&d0, &d1, ConnectionEvent::Connect);
        let expected = Digest::of_parts(&[d0.as_bytes(), d1.as_bytes(), b"CONNECT"]);
        assert_eq!(after, expected);

        let after_disconnect = extend_history(&after, &d1, ConnectionEvent::Disconnect);
        let expected = Digest::of_parts(&[expected.as_bytes(), d1.as_bytes(), b"DISCONNECT"]);
        assert_eq!(after_disconnect, expected);
    }

    #[test]
    fn test_asymmetric_histories() {
        let da = Digest::of_parts(&[b"a"]);
        let db = Digest::of_parts(&[b"b"]);
        let ha = extend_history(&da, &db, ConnectionEvent::Connect);
        let hb = extend_history(&db, &da, ConnectionEvent::Connect);
        assert_ne!(ha, hb);
    }

    #[test]
    fn test_connect_and_disconnect_never_cancel() {
        let d = Digest::of_parts(&[b"a"]);
        let peer = Digest::of_parts(&[b"b"]);
        let connected = extend_history(&d, &peer, ConnectionEvent::Connect);
        let back = extend_history(&connected, &peer, ConnectionEvent::Disconnect);
        assert_ne!(back, d);
        assert_ne!(back, connected);
        assert_ne!(
            extend_history(&d, &peer, ConnectionEvent::Connect),
            extend_history(&d, &peer, ConnectionEvent::Disconnect)
        );
    }

    #[test]
    fn test_replay_matches_stepwise() {
        let d = Digest::of_parts(&[b"a"]);
        let p1 = Digest::of_parts(&[b"p1"]);
        let p2 = Digest::of_parts(&[b"p2"]);
        let stepwise = extend_history(
            &extend_history(&d, &p1, ConnectionEvent::Connect),
            &p2,
            ConnectionEvent::Connect,
        );
        let replayed = replay_history(
            d,
            [(ConnectionEvent::Connect, p1), (ConnectionEvent::Connect, p2)],
        );
        assert_eq!(stepwise, replayed);
        assert_eq!(replay_history(d, []), d);
    }

    #[test]
    fn test_event_codes() {
        for e in [ConnectionEvent::Connect, ConnectionEvent::Disconnect] {
            assert_eq!(ConnectionEvent::from_code(e.code()), Some(e));
        }
        assert_eq!(ConnectionEvent::from_code(0), None);
    }
}
