//! Security Monitor — enclave registry, lifecycle and connections
//!
//! - **Registry**: arena of enclave records and the lifecycle state machine
//! - **Connection**: all-or-nothing connect/disconnect with history extension
//! - **Peer**: connection log and fixed-size peer descriptors
//! - **Platform**: seam to the low-level calls (domain entry, mappings)
//! - **Config**: sizes and capacities the monitor enforces

mod alloc;
pub mod config;
pub mod connection;
pub mod error;
pub mod peer;
pub mod platform;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::MonitorConfig;
pub use error::{ConfigError, MonitorError, PlatformError};
pub use peer::{ConnectionLog, PeerDescriptor, PEER_DESCRIPTOR_LEN, REFERENCE_MAX};
pub use platform::{DomainExit, Entry, Platform, SimulatedPlatform};
pub use registry::{DestroyOutcome, EnclaveId, EnclaveState, EnclaveStatus, Monitor};
