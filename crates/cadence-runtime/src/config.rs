//! RTI configuration
//!
//! Loaded from a JSON file; every field is optional and durations are
//! human-readable ("500ms", "10s").

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cadence_coord::DisconnectPolicy;
use cadence_core::{CadenceError, CadenceResult};
use cadence_transport::{TransportConfig, DEFAULT_PORT};

use crate::LogConfig;

/// Federation id used when none is configured
pub const DEFAULT_FEDERATION_ID: &str = "Unidentified Federation";

/// How far clock synchronization goes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockSyncMode {
    /// No synchronization at all
    Off,
    /// Synchronize over TCP during the handshake only
    #[default]
    Init,
    /// Also synchronize periodically over UDP while running
    On,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RtiConfig {
    pub number_of_federates: u16,
    pub federation_id: String,
    /// TCP port; the runtime clock sync UDP socket binds the same number
    pub port: u16,
    pub clock_sync: ClockSyncMode,
    #[serde(with = "humantime_serde")]
    pub clock_sync_period: Duration,
    /// T1/T4 exchanges per synchronization window
    pub clock_sync_exchanges: u32,
    pub disconnect_policy: DisconnectPolicy,
    /// Added to the latest proposed start time
    #[serde(with = "humantime_serde")]
    pub start_delay: Duration,
    /// How long a stop round waits for replies before granting anyway
    #[serde(with = "humantime_serde")]
    pub stop_reply_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub udp_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub bind_retry_interval: Duration,
    pub bind_retry_attempts: u32,
    pub log: LogConfig,
}

impl Default for RtiConfig {
    fn default() -> Self {
        let transport = TransportConfig::default();
        RtiConfig {
            number_of_federates: 1,
            federation_id: DEFAULT_FEDERATION_ID.to_string(),
            port: DEFAULT_PORT,
            clock_sync: ClockSyncMode::default(),
            clock_sync_period: Duration::from_millis(5),
            clock_sync_exchanges: 10,
            disconnect_policy: DisconnectPolicy::default(),
            start_delay: Duration::from_secs(1),
            stop_reply_timeout: Duration::from_secs(10),
            tcp_timeout: transport.tcp_timeout,
            udp_timeout: transport.udp_timeout,
            bind_retry_interval: transport.bind_retry_interval,
            bind_retry_attempts: transport.bind_retry_attempts,
            log: LogConfig::default(),
        }
    }
}

impl RtiConfig {
    /// Read and validate a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> CadenceResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            CadenceError::InvalidConfig(format!("reading {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> CadenceResult<Self> {
        let config: RtiConfig = serde_json::from_str(text)
            .map_err(|e| CadenceError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CadenceResult<()> {
        if self.number_of_federates == 0 || self.number_of_federates == u16::MAX {
            return Err(CadenceError::InvalidConfig(format!(
                "number_of_federates must be between 1 and {}",
                u16::MAX - 1
            )));
        }
        if self.federation_id.len() > u8::MAX as usize {
            return Err(CadenceError::InvalidConfig(
                "federation_id longer than 255 bytes".into(),
            ));
        }
        if self.clock_sync_exchanges == 0 {
            return Err(CadenceError::InvalidConfig(
                "clock_sync_exchanges must be at least 1".into(),
            ));
        }
        if self.clock_sync == ClockSyncMode::On && self.clock_sync_period.is_zero() {
            return Err(CadenceError::InvalidConfig(
                "clock_sync_period must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Transport settings derived from this configuration
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            bind_retry_interval: self.bind_retry_interval,
            bind_retry_attempts: self.bind_retry_attempts,
            tcp_timeout: self.tcp_timeout,
            udp_timeout: self.udp_timeout,
            ..TransportConfig::default()
        }
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
