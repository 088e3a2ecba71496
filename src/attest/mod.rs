//! Attestation — signed reports and their independent verification
//!
//! - **Report**: digest, hash history, connection log, platform digest, signature, echoed data
//! - **Signer**: per-device ed25519 key and `Monitor::attest`
//! - **Verifier**: replays measurement and history from artifacts

pub mod report;
pub mod signer;
pub mod verifier;

pub use report::{Report, ReportError, MIN_REPORT_LEN, SIGNATURE_LEN};
pub use signer::{DeviceKey, MonitorIdentity};
pub use verifier::{ArtifactSource, FsArtifacts, MemoryArtifacts, Verification, Verifier};
