//! Report signing — per-device key and `Monitor::attest`

use super::report::{Report, SIGNATURE_LEN};
use crate::measure::{measure_platform, Digest};
use crate::monitor::{EnclaveId, Monitor, MonitorError, Platform};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use std::fmt;

/// Per-device signing key. The public half is provisioned to verifiers out of band.
pub struct DeviceKey {
    signing_key: SigningKey,
}

impl DeviceKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, String> {
        let bytes = hex::decode(s.trim()).map_err(|e| format!("invalid key hex: {}", e))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("device key must be 32 bytes, got {}", b.len()))?;
        Ok(Self::from_bytes(&seed))
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DeviceKey(public={})",
            hex::encode(self.verifying_key().as_bytes())
        )
    }
}

/// What the monitor signs with and reports about itself
#[derive(Debug)]
pub struct MonitorIdentity {
    key: DeviceKey,
    platform_digest: Digest,
}

impl MonitorIdentity {
    pub fn new(key: DeviceKey, platform_digest: Digest) -> Self {
        Self {
            key,
            platform_digest,
        }
    }

    /// Identity for a monitor whose image is `image`, loaded into a region of `region_size` bytes
    pub fn from_image(key: DeviceKey, image: &[u8], region_size: usize) -> Self {
        Self::new(key, measure_platform(image, region_size))
    }

    pub fn platform_digest(&self) -> &Digest {
        &self.platform_digest
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub(crate) fn key(&self) -> &DeviceKey {
        &self.key
    }
}

impl<P: Platform> Monitor<P> {
    /// Produce a signed report for a measured enclave, echoing `data`
    pub fn attest(&self, id: EnclaveId, data: &[u8]) -> Result<Report, MonitorError> {
        let record = self.record(id)?;
        let (digest, history) = match (record.digest, record.hash_history) {
            (Some(d), Some(h)) if record.state.is_measured() => (d, h),
            _ => {
                return Err(MonitorError::InvalidState {
                    id,
                    state: record.state,
                    op: "attest",
                })
            }
        };
        if data.len() > self.config.attest_data_max {
            return Err(MonitorError::InvalidArgument(format!(
                "attestation data is {} bytes, limit is {}",
                data.len(),
                self.config.attest_data_max
            )));
        }

        let report = Report::assemble(
            digest,
            history,
            record.log.entries().to_vec(),
            *self.identity.platform_digest(),
            data.to_vec(),
            self.identity.key(),
        );
        log::info!(
            "Attested enclave {}: digest={} history={} log={}",
            id,
            digest.short(),
            history.short(),
            record.log.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::test_support::{launch, monitor, DEVICE_SEED};
    use ed25519_dalek::Signature;

    #[test]
    fn test_device_key_round_trip() {
        let key = DeviceKey::from_bytes(&DEVICE_SEED);
        let again = DeviceKey::from_hex(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(key.verifying_key(), again.verifying_key());
        assert!(DeviceKey::from_hex("abcd").is_err());
        assert!(!format!("{:?}", key).contains(&hex::encode(key.to_bytes())));
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(
            DeviceKey::generate().verifying_key(),
            DeviceKey::generate().verifying_key()
        );
    }

    #[test]
    fn test_report_reflects_enclave() {
        let mut m = monitor();
        let a = launch(&mut m, "sensor");
        let b = launch(&mut m, "actuator");
        m.connect(a, b).unwrap();

        let report = m.attest(a, b"challenge").unwrap();
        assert_eq!(report.digest(), &m.measurement(a).unwrap());
        assert_eq!(report.hash_history(), &m.hash_history(a).unwrap());
        assert_eq!(report.connection_log(), m.connection_log(a).unwrap());
        assert_eq!(report.platform_digest(), m.identity().platform_digest());
        assert_eq!(report.data(), b"challenge");

        let sig = Signature::from_bytes(report.signature());
        m.identity()
            .verifying_key()
            .verify_strict(&report.signed_message(), &sig)
            .unwrap();
    }

    #[test]
    fn test_attest_requires_finalize() {
        let mut m = monitor();
        let id = m.allocate(8).unwrap();
        assert!(matches!(m.attest(id, b""), Err(MonitorError::InvalidState { .. })));
        m.destroy(id);
        assert!(matches!(m.attest(id, b""), Err(MonitorError::InvalidHandle(_))));
    }

    #[test]
    fn test_attest_data_limit() {
        let mut m = monitor();
        let id = launch(&mut m, "sensor");
        let max = m.config().attest_data_max;
        assert!(m.attest(id, &vec![0u8; max]).is_ok());
        assert!(matches!(
            m.attest(id, &vec![0u8; max + 1]),
            Err(MonitorError::InvalidArgument(_))
        ));
    }
}
