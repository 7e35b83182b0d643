//! Simulation settings for regcache-sim.

use anyhow::{anyhow, Result};
use serde::Deserialize;
use sip_regcache::{RegCacheConfig, MAX_BUCKET_COUNT};
use std::path::Path;

/// Everything a run needs; every field has a default so a config file may
/// set only what it changes.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Settings handed to the registration cache.
    pub cache: RegCacheConfig,

    /// Number of simulated devices.
    pub devices: usize,

    /// Number of distinct AORs the devices share.
    pub aors: usize,

    /// Expiry devices ask for.
    pub device_expires: u32,

    /// Longest expiry the mock registrar grants.
    pub registrar_max_expires: u32,

    /// Real milliseconds per simulated second.
    pub step_ms: u64,

    /// REGISTERs sent per simulated second.
    pub registers_per_step: usize,

    /// Chance that a device's public port changes before it registers.
    pub rebind_probability: f64,

    /// Chance that a REGISTER unregisters instead of refreshing.
    pub unregister_probability: f64,

    /// `host[:port]` placed in forwarded contacts.
    pub contact_host: String,

    /// Prefix of hidden contact user parts.
    pub hiding_prefix: String,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cache: RegCacheConfig::default()
                .with_min_reg_expires(1800)
                .with_max_ua_expires(60),
            devices: 500,
            aors: 200,
            device_expires: 3600,
            registrar_max_expires: 7200,
            step_ms: 10,
            registers_per_step: 20,
            rebind_probability: 0.01,
            unregister_probability: 0.005,
            contact_host: "198.51.100.1:5060".to_string(),
            hiding_prefix: "sbc-".to_string(),
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        if self.devices == 0 || self.aors == 0 {
            return Err(anyhow!("devices and aors must be positive"));
        }
        if self.cache.bucket_count > MAX_BUCKET_COUNT {
            return Err(anyhow!(
                "bucket_count must be at most {}, got {}",
                MAX_BUCKET_COUNT,
                self.cache.bucket_count
            ));
        }
        for (name, p) in [
            ("rebind_probability", self.rebind_probability),
            ("unregister_probability", self.unregister_probability),
        ] {
            if !(0.0..=1.0).contains(&p) {
                return Err(anyhow!("{} must be within 0..=1, got {}", name, p));
            }
        }
        Ok(())
    }
}

/// Reads a JSON config file.
pub fn load(path: &Path) -> Result<SimConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read {}: {}", path.display(), e))?;
    let config: SimConfig = serde_json::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sip_regcache::CacheMode;

    #[test]
    fn partial_file_keeps_defaults() {
        let config: SimConfig = serde_json::from_str(
            r#"{ "devices": 10, "cache": { "mode": "registrar", "bucket_count": 64 } }"#,
        )
        .unwrap();
        assert_eq!(config.devices, 10);
        assert_eq!(config.aors, 200);
        assert_eq!(config.cache.mode, CacheMode::Registrar);
        assert_eq!(config.cache.bucket_count, 64);
        assert_eq!(config.cache.gc_cycle_secs, 10);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_probabilities() {
        let config = SimConfig {
            rebind_probability: 1.5,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_oversized_bucket_count() {
        let config: SimConfig =
            serde_json::from_str(r#"{ "cache": { "bucket_count": 18446744073709551615 } }"#).unwrap();
        assert!(config.validate().is_err());
    }
}
