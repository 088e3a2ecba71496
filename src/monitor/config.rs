//! Monitor configuration

use super::error::ConfigError;
use crate::channel::MAILBOX_HEADER_LEN;
use crate::region::PAGE_SIZE;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sizes and capacities the monitor enforces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Physical base address of memory handed out to enclaves
    pub dram_base: u64,
    /// Total pages the region allocator may hand out
    pub total_pages: usize,
    /// Maximum number of live enclaves
    pub max_enclaves: usize,
    /// Untrusted shared region per enclave (0 = none)
    pub untrusted_pages: usize,
    /// Connector region per enclave (0 = enclave cannot be connected)
    pub connector_pages: usize,
    /// Entries each connection log can hold
    pub connection_log_capacity: usize,
    /// Payload bytes of the mailbox placed on a connector region
    pub mailbox_capacity: usize,
    /// Maximum length of the data section echoed in a report
    pub attest_data_max: usize,
    /// Size the platform image is padded to before it is measured
    pub platform_region_size: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            dram_base: 0x8000_0000,
            total_pages: 16 * 1024,
            max_enclaves: 16,
            untrusted_pages: 64,
            connector_pages: 2,
            connection_log_capacity: 5,
            mailbox_capacity: 256,
            attest_data_max: 1024,
            platform_region_size: 0x1ff000,
        }
    }
}

impl MonitorConfig {
    /// Load a config from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.dram_base % PAGE_SIZE as u64 != 0 {
            return invalid(format!("dram_base {:#x} is not page aligned", self.dram_base));
        }
        if self.total_pages == 0 || self.max_enclaves == 0 {
            return invalid("total_pages and max_enclaves must be non-zero".into());
        }
        let span = (self.total_pages as u64).checked_mul(PAGE_SIZE as u64);
        if span.and_then(|s| self.dram_base.checked_add(s)).is_none() {
            return invalid("allocator range overflows the address space".into());
        }
        if self.connection_log_capacity == 0 {
            return invalid("connection_log_capacity must be non-zero".into());
        }
        if self.connector_pages > 0 {
            let room = self
                .connector_pages
                .checked_mul(PAGE_SIZE)
                .map(|bytes| bytes - MAILBOX_HEADER_LEN);
            if self.mailbox_capacity == 0 || room.map_or(true, |room| self.mailbox_capacity > room) {
                return invalid(format!(
                    "mailbox_capacity {} does not fit a {}-page connector region",
                    self.mailbox_capacity, self.connector_pages
                ));
            }
        }
        if self.attest_data_max > u32::MAX as usize {
            return invalid("attest_data_max exceeds the report length field".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        MonitorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_mailbox_must_fit_connector() {
        let mut config = MonitorConfig::default();
        config.connector_pages = 1;
        config.mailbox_capacity = PAGE_SIZE;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_huge_connector_rejected() {
        let config: MonitorConfig =
            serde_json::from_str(&format!(r#"{{ "connector_pages": {} }}"#, usize::MAX)).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_log_capacity_rejected() {
        let config = MonitorConfig {
            connection_log_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("monitor.json");
        let config = MonitorConfig {
            max_enclaves: 4,
            connection_log_capacity: 8,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(MonitorConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.json");
        std::fs::write(&path, r#"{ "max_enclaves": 2 }"#).unwrap();
        let config = MonitorConfig::load(&path).unwrap();
        assert_eq!(config.max_enclaves, 2);
        assert_eq!(config.connection_log_capacity, 5);
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(MonitorConfig::load(&path), Err(ConfigError::Parse(_))));
    }
}
