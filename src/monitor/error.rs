use super::registry::{EnclaveId, EnclaveState};

/// Errors returned by monitor calls
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("Invalid enclave handle: {0}")]
    InvalidHandle(EnclaveId),

    #[error("Enclave {id} is {state:?}, cannot {op}")]
    InvalidState {
        id: EnclaveId,
        state: EnclaveState,
        op: &'static str,
    },

    #[error("Resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid layout: {0}")]
    LayoutInvalid(String),

    #[error("Low-level call failed for enclave {id}: {reason}")]
    LowLevelCallFailure { id: EnclaveId, reason: String },

    #[error("Connection log of enclave {id} is full ({capacity} entries)")]
    LogFull { id: EnclaveId, capacity: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

/// Failure reported by the platform layer underneath the monitor
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("platform call `{call}` failed: {reason}")]
pub struct PlatformError {
    pub call: &'static str,
    pub reason: String,
}

impl PlatformError {
    pub fn new(call: &'static str, reason: impl Into<String>) -> Self {
        Self {
            call,
            reason: reason.into(),
        }
    }
}

/// Errors loading or validating a `MonitorConfig`
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}
