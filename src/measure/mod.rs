//! Measurement — digests of loaded images and the hash-history chain
//!
//! - **Digest**: fixed-size SHA3-512 measurement value
//! - **Engine**: content-addressed measurement of a loaded image
//! - **Chain**: connect/disconnect extension rule and replay

pub mod chain;
pub mod digest;
pub mod engine;

pub use chain::{extend_history, replay_history, ConnectionEvent};
pub use digest::{Digest, MD_SIZE};
pub use engine::{measure_artifacts, measure_layout, measure_platform, ImageBundle};
