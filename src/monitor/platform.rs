//! Platform seam — the low-level calls the monitor delegates to hardware
//!
//! The monitor decides *whether* a transition is legal; a `Platform`
//! performs it (entering a domain, wiring a shared mapping, reclaiming
//! memory). Any `Err` returned here is a low-level call failure.

use super::error::PlatformError;
use super::registry::EnclaveId;
use crate::region::RegionDescriptor;
use std::collections::{HashMap, HashSet, VecDeque};

/// How control is handed to the isolated domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entry {
    /// First entry after finalize
    Run,
    /// Re-entry after the domain yielded
    Resume,
}

/// Why control came back from the isolated domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainExit {
    /// The domain finished and returned this value
    Exited(u64),
    /// The domain yielded (interrupt or host service request) with this value
    Yielded(u64),
}

impl DomainExit {
    pub fn value(self) -> u64 {
        match self {
            DomainExit::Exited(v) | DomainExit::Yielded(v) => v,
        }
    }
}

/// Low-level operations behind the monitor call interface
pub trait Platform {
    /// Transfer control into the domain and block until it exits or yields
    fn enter(&mut self, id: EnclaveId, entry: Entry) -> Result<DomainExit, PlatformError>;

    /// Map a peer's connector region into `into`
    fn map_shared(&mut self, into: EnclaveId, region: &RegionDescriptor) -> Result<(), PlatformError>;

    /// Remove a mapping created by `map_shared`
    fn unmap_shared(&mut self, from: EnclaveId, region: &RegionDescriptor) -> Result<(), PlatformError>;

    /// Reclaim every region owned by a destroyed enclave
    fn release(&mut self, id: EnclaveId, regions: &[RegionDescriptor]) -> Result<(), PlatformError>;
}

/// Software platform for development and tests.
///
/// Domain exits are scripted per enclave; an enclave with nothing scripted
/// exits with value 0. Failures can be injected for any call.
#[derive(Debug, Default)]
pub struct SimulatedPlatform {
    exits: HashMap<EnclaveId, VecDeque<Result<DomainExit, PlatformError>>>,
    fail_map_into: HashSet<EnclaveId>,
    fail_release: bool,
    mappings: HashMap<EnclaveId, Vec<RegionDescriptor>>,
    entries: Vec<(EnclaveId, Entry)>,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `enter` for `id`
    pub fn script_exit(&mut self, id: EnclaveId, exit: DomainExit) {
        self.exits.entry(id).or_default().push_back(Ok(exit));
    }

    /// Make the next `enter` for `id` fail
    pub fn script_failure(&mut self, id: EnclaveId, reason: &str) {
        self.exits
            .entry(id)
            .or_default()
            .push_back(Err(PlatformError::new("enter", reason)));
    }

    /// Make every `map_shared` into `id` fail until cleared
    pub fn fail_mappings_into(&mut self, id: EnclaveId, fail: bool) {
        if fail {
            self.fail_map_into.insert(id);
        } else {
            self.fail_map_into.remove(&id);
        }
    }

    pub fn fail_releases(&mut self, fail: bool) {
        self.fail_release = fail;
    }

    /// Regions currently mapped into `id` through `map_shared`
    pub fn mappings(&self, id: EnclaveId) -> &[RegionDescriptor] {
        self.mappings.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every entry performed so far, in order
    pub fn entries(&self) -> &[(EnclaveId, Entry)] {
        &self.entries
    }
}

impl Platform for SimulatedPlatform {
    fn enter(&mut self, id: EnclaveId, entry: Entry) -> Result<DomainExit, PlatformError> {
        self.entries.push((id, entry));
        self.exits
            .get_mut(&id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(DomainExit::Exited(0)))
    }

    fn map_shared(&mut self, into: EnclaveId, region: &RegionDescriptor) -> Result<(), PlatformError> {
        if self.fail_map_into.contains(&into) {
            return Err(PlatformError::new("map_shared", format!("cannot map into {}", into)));
        }
        self.mappings.entry(into).or_default().push(*region);
        Ok(())
    }

    fn unmap_shared(&mut self, from: EnclaveId, region: &RegionDescriptor) -> Result<(), PlatformError> {
        if let Some(mapped) = self.mappings.get_mut(&from) {
            mapped.retain(|r| r != region);
        }
        Ok(())
    }

    fn release(&mut self, id: EnclaveId, _regions: &[RegionDescriptor]) -> Result<(), PlatformError> {
        self.mappings.remove(&id);
        self.exits.remove(&id);
        if self.fail_release {
            return Err(PlatformError::new("release", "simulated release failure"));
        }
        Ok(())
    }
}
