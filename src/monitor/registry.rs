//! Enclave Registry — lifecycle state machine and region ownership
//!
//! Enclave records live in an arena addressed by `EnclaveId` (slot index +
//! generation). A destroyed slot bumps its generation, so stale handles are
//! recognized instead of aliasing a newer enclave.
//!
//! Lifecycle: `Allocated → Finalized → Running ⇄ Suspended → Destroyed`.
//! Every call runs to completion against `&mut self`, so monitor calls are
//! serialized by construction.

use super::alloc::PageAllocator;
use super::config::MonitorConfig;
use super::error::{ConfigError, MonitorError};
use super::peer::{check_reference, ConnectionLog, PeerDescriptor};
use super::platform::{DomainExit, Entry, Platform};
use crate::attest::MonitorIdentity;
use crate::channel::{MailboxReceiver, MailboxSender, SharedBuffer};
use crate::measure::{measure_layout, Digest, ImageBundle};
use crate::region::{page_round_up, Layout, Permission, RegionDescriptor, RegionKind, PAGE_SIZE};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

const FIRST_GENERATION: u32 = 1;

/// Opaque enclave handle: arena slot plus generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnclaveId {
    index: u32,
    generation: u32,
}

impl EnclaveId {
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    pub const fn index(self) -> u32 {
        self.index
    }

    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for EnclaveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "eid:{}.{}", self.index, self.generation)
    }
}

/// Lifecycle state of an enclave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnclaveState {
    /// Regions reserved, image not yet measured
    Allocated,
    /// Measured; may be run or connected
    Finalized,
    /// Entered at least once and not parked for host service
    Running,
    /// Yielded control; waiting for `resume`
    Suspended,
    /// Regions released and record removed
    Destroyed,
}

impl EnclaveState {
    pub fn is_connectable(self) -> bool {
        matches!(self, EnclaveState::Finalized | EnclaveState::Running)
    }

    pub fn is_measured(self) -> bool {
        matches!(
            self,
            EnclaveState::Finalized | EnclaveState::Running | EnclaveState::Suspended
        )
    }
}

/// Result of `destroy` / `release`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestroyOutcome {
    /// The enclave existed and has been torn down
    Destroyed,
    /// Nothing to do: the handle is unknown or already destroyed
    AlreadyGone,
    /// `release` on an enclave whose destroy-on-release flag is cleared
    Retained,
}

pub(crate) struct Connector {
    pub(crate) region: RegionDescriptor,
    pub(crate) buffer: Arc<SharedBuffer>,
}

/// A peer's connector mapped into this enclave
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub(crate) peer: EnclaveId,
    pub(crate) region: RegionDescriptor,
    pub(crate) buffer: Arc<SharedBuffer>,
}

pub(crate) struct EnclaveRecord {
    pub(crate) state: EnclaveState,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) exclusive: RegionDescriptor,
    pub(crate) memory: Vec<u8>,
    pub(crate) untrusted: Option<(RegionDescriptor, Vec<u8>)>,
    pub(crate) connector: Option<Connector>,
    pub(crate) links: Vec<Link>,
    pub(crate) image_reference: Option<String>,
    pub(crate) layout: Option<Layout>,
    pub(crate) digest: Option<Digest>,
    pub(crate) hash_history: Option<Digest>,
    pub(crate) log: ConnectionLog,
    pub(crate) destroy_on_release: bool,
    pub(crate) last_exit: Option<u64>,
}

impl EnclaveRecord {
    fn regions(&self) -> Vec<RegionDescriptor> {
        let mut regions = vec![self.exclusive];
        if let Some((r, _)) = &self.untrusted {
            regions.push(*r);
        }
        if let Some(c) = &self.connector {
            regions.push(c.region);
        }
        regions
    }

    pub(crate) fn link_to(&self, peer: EnclaveId) -> Option<&Link> {
        self.links.iter().find(|l| l.peer == peer)
    }
}

struct Slot {
    generation: u32,
    record: Option<EnclaveRecord>,
}

/// Snapshot of an enclave for hosts and tooling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnclaveStatus {
    pub id: EnclaveId,
    pub state: EnclaveState,
    pub created_at: DateTime<Utc>,
    pub image_reference: Option<String>,
    pub layout: Option<Layout>,
    pub digest: Option<Digest>,
    pub hash_history: Option<Digest>,
    pub connection_log_len: usize,
    pub regions: Vec<RegionDescriptor>,
    pub linked_peers: Vec<EnclaveId>,
    pub last_exit: Option<u64>,
    pub destroy_on_release: bool,
}

/// The monitor: owns every enclave record and mediates all access to them
pub struct Monitor<P: Platform> {
    pub(crate) config: MonitorConfig,
    pub(crate) platform: P,
    pub(crate) identity: MonitorIdentity,
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    pages: PageAllocator,
}

fn live(slot: &mut Slot, id: EnclaveId) -> Result<&mut EnclaveRecord, MonitorError> {
    match slot.record.as_mut() {
        Some(record) if slot.generation == id.generation() => Ok(record),
        _ => Err(MonitorError::InvalidHandle(id)),
    }
}

impl<P: Platform> Monitor<P> {
    pub fn new(config: MonitorConfig, platform: P, identity: MonitorIdentity) -> Result<Self, ConfigError> {
        config.validate()?;
        let pages = PageAllocator::new(config.dram_base, config.total_pages);
        info!(
            "Monitor started: {} pages at {:#x}, up to {} enclaves, platform={}",
            config.total_pages,
            config.dram_base,
            config.max_enclaves,
            identity.platform_digest().short()
        );
        Ok(Self {
            config,
            platform,
            identity,
            slots: Vec::new(),
            free_slots: Vec::new(),
            pages,
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn platform_mut(&mut self) -> &mut P {
        &mut self.platform
    }

    pub fn identity(&self) -> &MonitorIdentity {
        &self.identity
    }

    /// Number of live enclaves
    pub fn count(&self) -> usize {
        self.slots.iter().filter(|s| s.record.is_some()).count()
    }

    pub fn ids(&self) -> Vec<EnclaveId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.record.is_some())
            .map(|(i, s)| EnclaveId::from_parts(i as u32, s.generation))
            .collect()
    }

    /// Pages currently handed out to enclaves
    pub fn used_pages(&self) -> usize {
        self.pages.used_pages()
    }

    // --- Lifecycle ---

    /// Reserve an exclusive region of at least `min_pages` pages, plus the
    /// configured untrusted and connector regions.
    pub fn allocate(&mut self, min_pages: usize) -> Result<EnclaveId, MonitorError> {
        if min_pages == 0 {
            return Err(MonitorError::InvalidArgument("min_pages must be non-zero".into()));
        }
        if self.count() >= self.config.max_enclaves {
            return Err(MonitorError::ResourceExhausted(format!(
                "enclave table full ({} enclaves)",
                self.config.max_enclaves
            )));
        }

        let exclusive = self.reserve(min_pages, Permission::ReadWriteExecute, RegionKind::Exclusive)?;
        let untrusted = match self.config.untrusted_pages {
            0 => None,
            pages => match self.reserve(pages, Permission::ReadWrite, RegionKind::Untrusted) {
                Ok(r) => Some(r),
                Err(e) => {
                    self.unreserve(&[exclusive]);
                    return Err(e);
                }
            },
        };
        let connector = match self.config.connector_pages {
            0 => None,
            pages => match self.reserve(pages, Permission::ReadWrite, RegionKind::Connector) {
                Ok(r) => Some(r),
                Err(e) => {
                    let mut taken = vec![exclusive];
                    taken.extend(untrusted);
                    self.unreserve(&taken);
                    return Err(e);
                }
            },
        };

        let record = EnclaveRecord {
            state: EnclaveState::Allocated,
            created_at: Utc::now(),
            exclusive,
            memory: vec![0u8; exclusive.len() as usize],
            untrusted: untrusted.map(|r| (r, vec![0u8; r.len() as usize])),
            connector: connector.map(|region| Connector {
                region,
                buffer: Arc::new(SharedBuffer::new(self.config.mailbox_capacity)),
            }),
            links: Vec::new(),
            image_reference: None,
            layout: None,
            digest: None,
            hash_history: None,
            log: ConnectionLog::with_capacity(self.config.connection_log_capacity),
            destroy_on_release: true,
            last_exit: None,
        };

        let id = match self.free_slots.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.record = Some(record);
                EnclaveId::from_parts(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: FIRST_GENERATION,
                    record: Some(record),
                });
                EnclaveId::from_parts(index, FIRST_GENERATION)
            }
        };

        info!("Allocated enclave {}: exclusive {}", id, exclusive);
        Ok(id)
    }

    /// Record the image reference peers will log for this enclave
    pub fn set_image_reference(&mut self, id: EnclaveId, reference: &str) -> Result<(), MonitorError> {
        check_reference(reference).map_err(MonitorError::InvalidArgument)?;
        let record = self.require(id, EnclaveState::Allocated, "set image reference")?;
        record.image_reference = Some(reference.to_string());
        Ok(())
    }

    /// Place the artifacts of `bundle` contiguously, page aligned, at the
    /// start of the exclusive region and return the resulting layout.
    pub fn load_image(&mut self, id: EnclaveId, bundle: &ImageBundle) -> Result<Layout, MonitorError> {
        check_reference(&bundle.reference).map_err(MonitorError::InvalidArgument)?;
        if bundle.loader.is_empty() || bundle.runtime.is_empty() || bundle.app.is_empty() {
            return Err(MonitorError::LayoutInvalid(
                "loader, runtime and application must all be non-empty".into(),
            ));
        }
        let record = self.require(id, EnclaveState::Allocated, "load an image")?;
        let needed = bundle.image_pages();
        if needed > record.exclusive.pages() {
            return Err(MonitorError::InvalidArgument(format!(
                "image needs {} pages, exclusive region has {}",
                needed,
                record.exclusive.pages()
            )));
        }

        record.memory.fill(0);
        let base = record.exclusive.base();
        let mut cursor = 0usize;
        let mut bases = [0u64; 4];
        for (slot, blob) in [&bundle.loader, &bundle.runtime, &bundle.app].into_iter().enumerate() {
            bases[slot] = base + cursor as u64;
            record.memory[cursor..cursor + blob.len()].copy_from_slice(blob);
            cursor += page_round_up(blob.len());
        }
        bases[3] = base + cursor as u64;

        record.image_reference = Some(bundle.reference.clone());
        Ok(Layout {
            loader_base: bases[0],
            runtime_base: bases[1],
            app_base: bases[2],
            free_base: bases[3],
        })
    }

    /// Validate the layout, measure the image and initialize the hash history
    pub fn finalize(&mut self, id: EnclaveId, layout: Layout) -> Result<(), MonitorError> {
        let record = self.require(id, EnclaveState::Allocated, "finalize")?;

        let others: Vec<RegionDescriptor> = record
            .regions()
            .into_iter()
            .filter(|r| r.kind() != RegionKind::Exclusive)
            .collect();
        layout
            .validate(&record.exclusive, &others)
            .map_err(MonitorError::LayoutInvalid)?;
        let digest =
            measure_layout(&layout, &record.exclusive, &record.memory).map_err(MonitorError::LayoutInvalid)?;

        record.layout = Some(layout);
        record.digest = Some(digest);
        record.hash_history = Some(digest);
        record.state = EnclaveState::Finalized;
        info!("Finalized enclave {}: digest={}", id, digest.short());
        Ok(())
    }

    /// First entry into a finalized enclave
    pub fn run(&mut self, id: EnclaveId) -> Result<DomainExit, MonitorError> {
        self.require(id, EnclaveState::Finalized, "run")?;
        self.enter(id, Entry::Run)
    }

    /// Re-enter an enclave that yielded
    pub fn resume(&mut self, id: EnclaveId) -> Result<DomainExit, MonitorError> {
        self.require(id, EnclaveState::Suspended, "resume")?;
        self.enter(id, Entry::Resume)
    }

    fn enter(&mut self, id: EnclaveId, entry: Entry) -> Result<DomainExit, MonitorError> {
        self.record_mut(id)?.state = EnclaveState::Running;

        match self.platform.enter(id, entry) {
            Ok(exit) => {
                let record = self.record_mut(id)?;
                record.last_exit = Some(exit.value());
                if let DomainExit::Yielded(_) = exit {
                    record.state = EnclaveState::Suspended;
                }
                info!("Enclave {} {:?} returned {:?}", id, entry, exit);
                Ok(exit)
            }
            Err(e) => {
                error!("Enclave {} {:?} failed, destroying: {}", id, entry, e);
                self.teardown(id);
                Err(MonitorError::LowLevelCallFailure {
                    id,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Release every region of the enclave and remove its record. Safe to
    /// call on an already destroyed or unknown handle.
    pub fn destroy(&mut self, id: EnclaveId) -> DestroyOutcome {
        if self.record(id).is_err() {
            warn!("destroy {}: skipping (enclave does not exist)", id);
            return DestroyOutcome::AlreadyGone;
        }
        self.teardown(id);
        info!("Destroyed enclave {}", id);
        DestroyOutcome::Destroyed
    }

    /// Host handle closed: destroy if the destroy-on-release flag is set
    pub fn release(&mut self, id: EnclaveId) -> DestroyOutcome {
        match self.record(id) {
            Ok(record) if !record.destroy_on_release => {
                info!("Released handle to {}, enclave retained", id);
                DestroyOutcome::Retained
            }
            _ => self.destroy(id),
        }
    }

    pub fn set_destroy_on_release(&mut self, id: EnclaveId, flag: bool) -> Result<(), MonitorError> {
        self.record_mut(id)?.destroy_on_release = flag;
        Ok(())
    }

    fn teardown(&mut self, id: EnclaveId) {
        let Some(slot) = self.slots.get_mut(id.index() as usize) else {
            return;
        };
        if slot.generation != id.generation() {
            return;
        }
        let Some(mut record) = slot.record.take() else {
            return;
        };
        slot.generation = slot.generation.wrapping_add(1).max(FIRST_GENERATION);
        self.free_slots.push(id.index());
        record.state = EnclaveState::Destroyed;

        // Drop every peer mapping of our connector
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Some(other) = slot.record.as_mut() else {
                continue;
            };
            let Some(pos) = other.links.iter().position(|l| l.peer == id) else {
                continue;
            };
            let link = other.links.remove(pos);
            let other_id = EnclaveId::from_parts(index as u32, slot.generation);
            if let Err(e) = self.platform.unmap_shared(other_id, &link.region) {
                warn!("unmap of {} connector from {} failed during destroy: {}", id, other_id, e);
            }
        }

        let regions = record.regions();
        if let Err(e) = self.platform.release(id, &regions) {
            error!("platform release of {} failed: {}", id, e);
        }
        self.unreserve(&regions);
    }

    // --- Accessors ---

    /// Lifecycle state; stale handles report `Destroyed`
    pub fn state(&self, id: EnclaveId) -> Result<EnclaveState, MonitorError> {
        match self.slots.get(id.index() as usize) {
            Some(slot) if slot.generation == id.generation() => slot
                .record
                .as_ref()
                .map(|r| r.state)
                .ok_or(MonitorError::InvalidHandle(id)),
            Some(slot) if id.generation() >= FIRST_GENERATION && id.generation() < slot.generation => {
                Ok(EnclaveState::Destroyed)
            }
            _ => Err(MonitorError::InvalidHandle(id)),
        }
    }

    pub fn measurement(&self, id: EnclaveId) -> Result<Digest, MonitorError> {
        let record = self.record(id)?;
        record.digest.ok_or(MonitorError::InvalidState {
            id,
            state: record.state,
            op: "read the measurement",
        })
    }

    pub fn hash_history(&self, id: EnclaveId) -> Result<Digest, MonitorError> {
        let record = self.record(id)?;
        record.hash_history.ok_or(MonitorError::InvalidState {
            id,
            state: record.state,
            op: "read the hash history",
        })
    }

    pub fn connection_log(&self, id: EnclaveId) -> Result<&[PeerDescriptor], MonitorError> {
        Ok(self.record(id)?.log.entries())
    }

    /// Host view of the untrusted shared region
    pub fn untrusted_mut(&mut self, id: EnclaveId) -> Result<&mut [u8], MonitorError> {
        let record = self.record_mut(id)?;
        let state = record.state;
        match record.untrusted.as_mut() {
            Some((_, memory)) => Ok(memory.as_mut_slice()),
            None => Err(MonitorError::InvalidState {
                id,
                state,
                op: "access an untrusted region it does not have",
            }),
        }
    }

    /// Receiving end of this enclave's own connector region (messages *to* it)
    pub fn inbox(&self, id: EnclaveId) -> Result<MailboxReceiver, MonitorError> {
        let record = self.record(id)?;
        match &record.connector {
            Some(c) => Ok(MailboxReceiver::new(c.buffer.clone())),
            None => Err(MonitorError::InvalidState {
                id,
                state: record.state,
                op: "open a mailbox without a connector region",
            }),
        }
    }

    /// Sending end of `peer`'s connector as mapped into `id` (messages *from* it)
    pub fn outbox(&self, id: EnclaveId, peer: EnclaveId) -> Result<MailboxSender, MonitorError> {
        let record = self.record(id)?;
        match record.link_to(peer) {
            Some(link) => Ok(MailboxSender::new(link.buffer.clone())),
            None => Err(MonitorError::InvalidState {
                id,
                state: record.state,
                op: "open a mailbox to an enclave it is not connected to",
            }),
        }
    }

    pub fn status(&self, id: EnclaveId) -> Result<EnclaveStatus, MonitorError> {
        let record = self.record(id)?;
        Ok(EnclaveStatus {
            id,
            state: record.state,
            created_at: record.created_at,
            image_reference: record.image_reference.clone(),
            layout: record.layout,
            digest: record.digest,
            hash_history: record.hash_history,
            connection_log_len: record.log.len(),
            regions: record.regions(),
            linked_peers: record.links.iter().map(|l| l.peer).collect(),
            last_exit: record.last_exit,
            destroy_on_release: record.destroy_on_release,
        })
    }

    // --- Internal helpers ---

    pub(crate) fn record(&self, id: EnclaveId) -> Result<&EnclaveRecord, MonitorError> {
        self.slots
            .get(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.record.as_ref())
            .ok_or(MonitorError::InvalidHandle(id))
    }

    pub(crate) fn record_mut(&mut self, id: EnclaveId) -> Result<&mut EnclaveRecord, MonitorError> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.record.as_mut())
            .ok_or(MonitorError::InvalidHandle(id))
    }

    /// Both records at once, for updates that must land on two enclaves together
    pub(crate) fn record_pair_mut(
        &mut self,
        a: EnclaveId,
        b: EnclaveId,
    ) -> Result<(&mut EnclaveRecord, &mut EnclaveRecord), MonitorError> {
        if a.index() == b.index() {
            return Err(MonitorError::InvalidArgument(format!(
                "{} and {} share a slot",
                a, b
            )));
        }
        let (lo, hi) = if a.index() < b.index() { (a, b) } else { (b, a) };
        if hi.index() as usize >= self.slots.len() {
            return Err(MonitorError::InvalidHandle(hi));
        }
        let (left, right) = self.slots.split_at_mut(hi.index() as usize);
        let record_lo = live(&mut left[lo.index() as usize], lo)?;
        let record_hi = live(&mut right[0], hi)?;
        Ok(if a.index() < b.index() {
            (record_lo, record_hi)
        } else {
            (record_hi, record_lo)
        })
    }

    fn require(
        &mut self,
        id: EnclaveId,
        expected: EnclaveState,
        op: &'static str,
    ) -> Result<&mut EnclaveRecord, MonitorError> {
        let record = self.record_mut(id)?;
        if record.state != expected {
            return Err(MonitorError::InvalidState {
                id,
                state: record.state,
                op,
            });
        }
        Ok(record)
    }

    fn reserve(
        &mut self,
        pages: usize,
        perm: Permission,
        kind: RegionKind,
    ) -> Result<RegionDescriptor, MonitorError> {
        let base = self.pages.alloc(pages).ok_or_else(|| {
            MonitorError::ResourceExhausted(format!(
                "no {} contiguous pages left for {:?} region ({} in use)",
                pages,
                kind,
                self.pages.used_pages()
            ))
        })?;
        RegionDescriptor::new(base, (pages * PAGE_SIZE) as u64, perm, kind).map_err(|e| {
            self.pages.release(base, pages);
            MonitorError::ResourceExhausted(e)
        })
    }

    fn unreserve(&mut self, regions: &[RegionDescriptor]) {
        for r in regions {
            self.pages.release(r.base(), r.pages());
        }
    }
}
