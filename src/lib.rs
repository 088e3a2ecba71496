//! Enclave Monitor — isolation, measurement and attestation of enclaves
//!
//! A security monitor that owns enclave memory regions, measures loaded
//! images, extends each enclave's hash history across connections, and signs
//! reports that an independent verifier can check against raw artifacts.

pub mod attest;
pub mod channel;
pub mod measure;
pub mod monitor;
pub mod region;

pub use attest::{DeviceKey, MonitorIdentity, Report, Verification, Verifier};
pub use channel::{MailboxReceiver, MailboxSender, Sent};
pub use measure::{ConnectionEvent, Digest, ImageBundle};
pub use monitor::{
    DestroyOutcome, DomainExit, EnclaveId, EnclaveState, Monitor, MonitorConfig, MonitorError,
    Platform, SimulatedPlatform,
};
pub use region::{Layout, RegionDescriptor};
