//! Independent verification of attestation reports
//!
//! The verifier trusts only the device public key and its own recomputation:
//! 1. Signature over the report body
//! 2. Initial digest re-measured from the subject's artifacts
//! 3. Hash history replayed from the connection log, re-measuring each peer
//! 4. Platform digest, when an expected value is configured
//! 5. Echoed data section against the challenge nonce (exact length and content)
//!
//! Mismatches are reported in a `Verification` value, never as errors.

use super::report::Report;
use crate::measure::{measure_artifacts, replay_history, Digest};
use ed25519_dalek::{Signature, VerifyingKey};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Resolves image references (as logged in peer descriptors) to application bytes
pub trait ArtifactSource {
    fn application(&self, reference: &str) -> Option<Vec<u8>>;
}

/// References are file paths, optionally relative to a root directory
#[derive(Debug, Clone, Default)]
pub struct FsArtifacts {
    root: Option<PathBuf>,
}

impl FsArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl ArtifactSource for FsArtifacts {
    fn application(&self, reference: &str) -> Option<Vec<u8>> {
        let path = match &self.root {
            Some(root) => root.join(reference.trim_start_matches('/')),
            None => PathBuf::from(reference),
        };
        std::fs::read(&path)
            .map_err(|e| warn!("cannot read artifact {}: {}", path.display(), e))
            .ok()
    }
}

/// In-memory artifacts keyed by reference
#[derive(Debug, Clone, Default)]
pub struct MemoryArtifacts {
    apps: HashMap<String, Vec<u8>>,
}

impl MemoryArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, app: Vec<u8>) {
        self.apps.insert(reference.into(), app);
    }
}

impl ArtifactSource for MemoryArtifacts {
    fn application(&self, reference: &str) -> Option<Vec<u8>> {
        self.apps.get(reference).cloned()
    }
}

/// Outcome of checking one report
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verification {
    pub signature_valid: bool,
    pub digest_matches: bool,
    pub history_matches: bool,
    /// `None` when no expected platform digest was configured
    pub platform_matches: Option<bool>,
    pub nonce_matches: bool,
    pub diagnostics: Vec<String>,
}

impl Verification {
    pub fn is_trusted(&self) -> bool {
        self.signature_valid
            && self.digest_matches
            && self.history_matches
            && self.platform_matches != Some(false)
            && self.nonce_matches
    }

    fn fail(&mut self, msg: String) {
        warn!("verification: {}", msg);
        self.diagnostics.push(msg);
    }
}

/// Verifier for enclaves built from one loader/runtime pair
pub struct Verifier<A: ArtifactSource> {
    public_key: VerifyingKey,
    loader: Vec<u8>,
    runtime: Vec<u8>,
    artifacts: A,
    expected_platform: Option<Digest>,
}

impl<A: ArtifactSource> Verifier<A> {
    pub fn new(public_key: VerifyingKey, loader: Vec<u8>, runtime: Vec<u8>, artifacts: A) -> Self {
        Self {
            public_key,
            loader,
            runtime,
            artifacts,
            expected_platform: None,
        }
    }

    /// Also require the report's platform digest to equal `digest`
    pub fn with_platform(mut self, digest: Digest) -> Self {
        self.expected_platform = Some(digest);
        self
    }

    /// Signature-only check
    pub fn check_signature(&self, report: &Report) -> bool {
        let signature = Signature::from_bytes(report.signature());
        self.public_key
            .verify_strict(&report.signed_message(), &signature)
            .is_ok()
    }

    /// Measure the application behind `reference` with this verifier's loader and runtime
    pub fn measure_reference(&self, reference: &str) -> Option<Digest> {
        let app = self.artifacts.application(reference)?;
        Some(measure_artifacts(&self.loader, &self.runtime, &app))
    }

    /// Full check of `report` for the enclave running `subject`, challenged with `nonce`
    pub fn verify(&self, report: &Report, subject: &str, nonce: &[u8]) -> Verification {
        let mut v = Verification::default();

        // 1. Signature
        v.signature_valid = self.check_signature(report);
        if !v.signature_valid {
            v.fail("signature does not verify under the device key".into());
        }

        // 2. Initial digest, recomputed from the subject artifact
        match self.measure_reference(subject) {
            Some(expected) if &expected == report.digest() => v.digest_matches = true,
            Some(expected) => v.fail(format!(
                "digest mismatch: report {} expected {}",
                report.digest().short(),
                expected.short()
            )),
            None => v.fail(format!("no artifact for subject {}", subject)),
        }

        // 3. Replay the connection log on top of the recomputed digest
        if v.digest_matches {
            match self.replay(report) {
                Ok(expected) if &expected == report.hash_history() => v.history_matches = true,
                Ok(expected) => v.fail(format!(
                    "hash history mismatch: report {} replayed {}",
                    report.hash_history().short(),
                    expected.short()
                )),
                Err(msg) => v.fail(msg),
            }
        }

        // 4. Platform digest
        if let Some(expected) = &self.expected_platform {
            let ok = expected == report.platform_digest();
            v.platform_matches = Some(ok);
            if !ok {
                v.fail(format!(
                    "platform digest mismatch: report {} expected {}",
                    report.platform_digest().short(),
                    expected.short()
                ));
            }
        }

        // 5. Nonce echo
        v.nonce_matches = report.data() == nonce;
        if !v.nonce_matches {
            v.fail(format!(
                "data section ({} bytes) does not match the {}-byte challenge",
                report.data().len(),
                nonce.len()
            ));
        }

        if v.is_trusted() {
            info!(
                "Report for {} verified: {} log entries",
                subject,
                report.connection_log().len()
            );
        }
        v
    }

    fn replay(&self, report: &Report) -> Result<Digest, String> {
        let mut cache: HashMap<&str, Digest> = HashMap::new();
        let mut events = Vec::with_capacity(report.connection_log().len());
        for entry in report.connection_log() {
            let reference = entry.reference();
            let digest = match cache.get(reference) {
                Some(d) => *d,
                None => {
                    let d = self
                        .measure_reference(reference)
                        .ok_or_else(|| format!("no artifact for peer {} ({})", entry.peer(), reference))?;
                    cache.insert(reference, d);
                    d
                }
            };
            events.push((entry.event(), digest));
        }
        Ok(replay_history(*report.digest(), events))
    }
}
