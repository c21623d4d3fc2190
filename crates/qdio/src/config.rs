//! Subchannel Configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{QdioError, QdioResult};

/// Device class (queue format)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Network adapter
    #[default]
    Qeth,
    /// Storage adapter
    Zfcp,
    /// Internal (memory-to-memory) network
    Iqdio,
}

/// Per-subchannel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QdioConfig {
    /// Queue format of the device
    pub device_class: DeviceClass,
    /// Skip the output doorbell while the previous slot is still pending
    pub fast_requeue: bool,
    /// Device interrupts on output completion
    pub output_pci: bool,
    /// Driver polls inbound queues instead of receiving handler calls
    pub inbound_polling: bool,
    /// Busy-bit spin window (microseconds)
    pub busy_patience_us: u64,
    /// Retries for a batch state operation without progress
    pub batch_retry_limit: u32,
    /// Wait for the establish interrupt (milliseconds)
    pub establish_timeout_ms: u64,
    /// Settle delay after activate (milliseconds)
    pub activate_settle_ms: u64,
    /// Wait for halt/clear completion (milliseconds)
    pub cleanup_timeout_ms: u64,
    /// Fallback timer after a submit (milliseconds)
    pub submit_timer_ms: u64,
    /// Fallback timer after a completion scan (milliseconds)
    pub completion_timer_ms: u64,
}

impl Default for QdioConfig {
    fn default() -> Self {
        Self {
            device_class: DeviceClass::Qeth,
            fast_requeue: true,
            output_pci: false,
            inbound_polling: true,
            busy_patience_us: 100,
            batch_retry_limit: 8,
            establish_timeout_ms: 1000,
            activate_settle_ms: 5,
            cleanup_timeout_ms: 10_000,
            submit_timer_ms: 1000,
            completion_timer_ms: 10_000,
        }
    }
}

impl QdioConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to a JSON file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> QdioResult<()> {
        let checks = [
            (self.busy_patience_us == 0, "busy_patience_us"),
            (self.batch_retry_limit == 0, "batch_retry_limit"),
            (self.establish_timeout_ms == 0, "establish_timeout_ms"),
            (self.cleanup_timeout_ms == 0, "cleanup_timeout_ms"),
            (self.submit_timer_ms == 0, "submit_timer_ms"),
            (self.completion_timer_ms == 0, "completion_timer_ms"),
        ];
        for (bad, name) in checks {
            if bad {
                return Err(QdioError::InvalidArgument(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub(crate) fn busy_patience(&self) -> Duration {
        Duration::from_micros(self.busy_patience_us)
    }

    pub(crate) fn establish_timeout(&self) -> Duration {
        Duration::from_millis(self.establish_timeout_ms)
    }

    pub(crate) fn activate_settle(&self) -> Duration {
        Duration::from_millis(self.activate_settle_ms)
    }

    pub(crate) fn cleanup_timeout(&self) -> Duration {
        Duration::from_millis(self.cleanup_timeout_ms)
    }

    pub(crate) fn submit_timer(&self) -> Duration {
        Duration::from_millis(self.submit_timer_ms)
    }

    pub(crate) fn completion_timer(&self) -> Duration {
        Duration::from_millis(self.completion_timer_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = QdioConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.busy_patience(), Duration::from_micros(100));
        assert_eq!(config.device_class, DeviceClass::Qeth);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = QdioConfig {
            batch_retry_limit: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(QdioError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_partial_json() {
        let config: QdioConfig =
            serde_json::from_str(r#"{"device_class": "iqdio", "fast_requeue": false}"#).unwrap();
        assert_eq!(config.device_class, DeviceClass::Iqdio);
        assert!(!config.fast_requeue);
        assert_eq!(config.batch_retry_limit, 8);
    }

    #[test]
    fn test_save_load_file() {
        let path = std::env::temp_dir().join(format!("qdio-config-{}.json", std::process::id()));
        let path = path.to_string_lossy().into_owned();
        let config = QdioConfig {
            device_class: DeviceClass::Zfcp,
            output_pci: true,
            ..Default::default()
        };
        config.save(&path).unwrap();
        let loaded = QdioConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, config);
    }
}
