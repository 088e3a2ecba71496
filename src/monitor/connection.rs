//! Connection Protocol — two-sided history extension and connector mapping
//!
//! `connect(a, b)` is all-or-nothing: every precondition is checked against
//! both records before anything changes, the platform mappings are wired with
//! rollback, both log entries are appended together, and only then are both
//! histories and link tables updated.

use super::error::MonitorError;
use super::peer::PeerDescriptor;
use super::platform::Platform;
use super::registry::{EnclaveId, EnclaveRecord, Link, Monitor};
use crate::channel::SharedBuffer;
use crate::measure::{extend_history, ConnectionEvent, Digest};
use crate::region::RegionDescriptor;
use log::{debug, info, warn};
use std::sync::Arc;

/// Everything one side contributes to a connection, captured before mutation
struct Side {
    id: EnclaveId,
    digest: Digest,
    connector: RegionDescriptor,
    buffer: Arc<SharedBuffer>,
    /// Entry for this side's own log, naming the other side
    entry: PeerDescriptor,
}

impl<P: Platform> Monitor<P> {
    /// Connect two finalized or running enclaves and map each side's
    /// connector region into the other.
    pub fn connect(&mut self, a: EnclaveId, b: EnclaveId) -> Result<(), MonitorError> {
        let (side_a, side_b) = self.prepare(a, b, ConnectionEvent::Connect)?;
        let (into_a, into_b) = (side_b.connector, side_a.connector);

        self.platform
            .map_shared(a, &into_a)
            .map_err(|e| MonitorError::LowLevelCallFailure {
                id: a,
                reason: e.to_string(),
            })?;
        if let Err(e) = self.platform.map_shared(b, &into_b) {
            self.unmap_quietly(a, &into_a);
            return Err(MonitorError::LowLevelCallFailure {
                id: b,
                reason: e.to_string(),
            });
        }

        if let Err(e) = self.commit(side_a, side_b, ConnectionEvent::Connect) {
            self.unmap_quietly(a, &into_a);
            self.unmap_quietly(b, &into_b);
            return Err(e);
        }
        info!("Connected {} <-> {}", a, b);
        Ok(())
    }

    /// Tear down a connection created by `connect`. Both histories absorb
    /// a disconnect event.
    pub fn disconnect(&mut self, a: EnclaveId, b: EnclaveId) -> Result<(), MonitorError> {
        let (side_a, side_b) = self.prepare(a, b, ConnectionEvent::Disconnect)?;
        let (from_a, from_b) = (side_b.connector, side_a.connector);

        self.commit(side_a, side_b, ConnectionEvent::Disconnect)?;
        self.unmap_quietly(a, &from_a);
        self.unmap_quietly(b, &from_b);
        info!("Disconnected {} <-> {}", a, b);
        Ok(())
    }

    fn unmap_quietly(&mut self, from: EnclaveId, region: &RegionDescriptor) {
        if let Err(e) = self.platform.unmap_shared(from, region) {
            warn!("unmap of {} from {} failed: {}", region, from, e);
        }
    }

    /// Check every precondition of a connection event without touching state
    fn prepare(
        &self,
        a: EnclaveId,
        b: EnclaveId,
        event: ConnectionEvent,
    ) -> Result<(Side, Side), MonitorError> {
        if a == b {
            return Err(MonitorError::InvalidState {
                id: a,
                state: self.record(a)?.state,
                op: "connect to itself",
            });
        }
        let reference_a = self.check_side(a, b, event)?;
        let reference_b = self.check_side(b, a, event)?;
        let entry_a = PeerDescriptor::new(b, event, reference_b).map_err(MonitorError::InvalidArgument)?;
        let entry_b = PeerDescriptor::new(a, event, reference_a).map_err(MonitorError::InvalidArgument)?;
        let side_a = self.side(a, entry_a)?;
        let side_b = self.side(b, entry_b)?;
        Ok((side_a, side_b))
    }

    /// Preconditions for `id`; returns the image reference its peer will log
    fn check_side(&self, id: EnclaveId, peer: EnclaveId, event: ConnectionEvent) -> Result<&str, MonitorError> {
        let record = self.record(id)?;
        let invalid = |op: &'static str| MonitorError::InvalidState {
            id,
            state: record.state,
            op,
        };

        let state_ok = match event {
            ConnectionEvent::Connect => record.state.is_connectable(),
            ConnectionEvent::Disconnect => record.state.is_measured(),
        };
        if !state_ok {
            return Err(invalid(match event {
                ConnectionEvent::Connect => "connect",
                ConnectionEvent::Disconnect => "disconnect",
            }));
        }

        if record.connector.is_none() {
            return Err(invalid("connect without a connector region"));
        }
        let reference = record
            .image_reference
            .as_deref()
            .ok_or_else(|| invalid("connect without an image reference"))?;
        let linked = record.link_to(peer).is_some();
        match event {
            ConnectionEvent::Connect if linked => return Err(invalid("connect twice to the same peer")),
            ConnectionEvent::Disconnect if !linked => {
                return Err(invalid("disconnect from an enclave it is not connected to"))
            }
            _ => {}
        }

        if record.log.is_full() {
            warn!(
                "{} {:?} {} rejected: connection log full",
                id, event, peer
            );
            return Err(MonitorError::LogFull {
                id,
                capacity: record.log.capacity(),
            });
        }
        if record.digest.is_none() {
            return Err(invalid("connect before finalize"));
        }
        Ok(reference)
    }

    fn side(&self, id: EnclaveId, entry: PeerDescriptor) -> Result<Side, MonitorError> {
        let record = self.record(id)?;
        let missing = |op: &'static str| MonitorError::InvalidState {
            id,
            state: record.state,
            op,
        };
        let connector = record
            .connector
            .as_ref()
            .ok_or_else(|| missing("connect without a connector region"))?;
        Ok(Side {
            id,
            digest: record.digest.ok_or_else(|| missing("connect before finalize"))?,
            connector: connector.region,
            buffer: connector.buffer.clone(),
            entry,
        })
    }

    /// Apply one event to both records. Both log entries land or neither
    /// does; histories and links change only after that.
    fn commit(&mut self, side_a: Side, side_b: Side, event: ConnectionEvent) -> Result<(), MonitorError> {
        let (record_a, record_b) = self.record_pair_mut(side_a.id, side_b.id)?;

        if let Err(rejected) = record_a.log.push(side_a.entry.clone()) {
            return Err(log_full(side_a.id, record_a, &rejected));
        }
        if let Err(rejected) = record_b.log.push(side_b.entry.clone()) {
            record_a.log.undo_last();
            return Err(log_full(side_b.id, record_b, &rejected));
        }

        apply(record_a, side_a.id, side_a.digest, &side_b, event);
        apply(record_b, side_b.id, side_b.digest, &side_a, event);
        Ok(())
    }
}

fn log_full(id: EnclaveId, record: &EnclaveRecord, rejected: &PeerDescriptor) -> MonitorError {
    warn!("{} dropped log entry for {}", id, rejected.peer());
    MonitorError::LogFull {
        id,
        capacity: record.log.capacity(),
    }
}

fn apply(record: &mut EnclaveRecord, id: EnclaveId, digest: Digest, peer: &Side, event: ConnectionEvent) {
    let history = record.hash_history.unwrap_or(digest);
    record.hash_history = Some(extend_history(&history, &peer.digest, event));
    match event {
        ConnectionEvent::Connect => record.links.push(Link {
            peer: peer.id,
            region: peer.connector,
            buffer: peer.buffer.clone(),
        }),
        ConnectionEvent::Disconnect => record.links.retain(|l| l.peer != peer.id),
    }
    debug!("{} history extended with {:?} {}", id, event, peer.id);
}
