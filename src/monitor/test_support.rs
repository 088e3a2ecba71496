use super::config::MonitorConfig;
use super::platform::SimulatedPlatform;
use super::registry::{EnclaveId, Monitor};
use crate::attest::{DeviceKey, MonitorIdentity};
use crate::measure::{measure_platform, ImageBundle};

pub(crate) const DEVICE_SEED: [u8; 32] = [7u8; 32];
pub(crate) const MONITOR_IMAGE: &[u8] = b"simulated security monitor image";

pub(crate) fn loader() -> Vec<u8> {
    vec![0x4c; 5000]
}

pub(crate) fn runtime() -> Vec<u8> {
    vec![0x52; 700]
}

pub(crate) fn app(name: &str) -> Vec<u8> {
    name.as_bytes().repeat(40)
}

pub(crate) fn bundle(name: &str) -> ImageBundle {
    ImageBundle::new(format!("/apps/{}.eapp", name), loader(), runtime(), app(name))
}

pub(crate) fn identity(config: &MonitorConfig) -> MonitorIdentity {
    MonitorIdentity::new(
        DeviceKey::from_bytes(&DEVICE_SEED),
        measure_platform(MONITOR_IMAGE, config.platform_region_size),
    )
}

pub(crate) fn monitor_with(config: MonitorConfig) -> Monitor<SimulatedPlatform> {
    let identity = identity(&config);
    Monitor::new(config, SimulatedPlatform::new(), identity).unwrap()
}

pub(crate) fn monitor() -> Monitor<SimulatedPlatform> {
    monitor_with(MonitorConfig::default())
}

/// Allocate, load and finalize an enclave running `name`
pub(crate) fn launch(m: &mut Monitor<SimulatedPlatform>, name: &str) -> EnclaveId {
    let id = m.allocate(32).unwrap();
    let layout = m.load_image(id, &bundle(name)).unwrap();
    m.finalize(id, layout).unwrap();
    id
}
