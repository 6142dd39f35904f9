//! DGC configuration.
//!
//! The timing values must be identical in every cooperating process: the
//! protocol assumes that a referencer talks to its referenced objects at
//! least once per `ttb`, and waits `tta` before giving up on one.

use crate::error::{DgcError, DgcResult};
use serde::Deserialize;
use std::time::Duration;

/// Env var enabling the DGC
pub const ENV_ENABLED: &str = "OTTER_DGC";
/// Env var overriding the tick period, in milliseconds
pub const ENV_TTB: &str = "OTTER_DGC_TTB";
/// Env var overriding the alone/grace timeout, in milliseconds
pub const ENV_TTA: &str = "OTTER_DGC_TTA";
/// Env var overriding the number of consecutive consensus rounds
pub const ENV_CONSENSUS: &str = "OTTER_DGC_CONSENSUS";

const DEFAULT_TTB_MS: u64 = 30_000;
const TTA_FACTOR: u64 = 5;

/// Distributed GC settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DgcConfig {
    /// Master switch. When off no collector state is created.
    pub enabled: bool,

    /// Tick period (TTB)
    #[serde(rename = "ttb_ms", with = "millis")]
    pub ttb: Duration,

    /// Alone and grace timeout (TTA)
    #[serde(rename = "tta_ms", with = "millis")]
    pub tta: Duration,

    /// Consecutive consensus rounds before declaring a cycle.
    /// Default: 1
    pub required_consensus: u32,

    /// Delay the first tick by a random fraction of `ttb`.
    /// Default: true
    pub startup_jitter: bool,

    /// Idle time before a send worker exits.
    /// Default: None (twice `tta`)
    #[serde(rename = "send_idle_timeout_ms", with = "opt_millis")]
    pub send_idle_timeout: Option<Duration>,
}

impl Default for DgcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttb: Duration::from_millis(DEFAULT_TTB_MS),
            tta: Duration::from_millis(DEFAULT_TTB_MS * TTA_FACTOR),
            required_consensus: 1,
            startup_jitter: true,
            send_idle_timeout: None,
        }
    }
}

impl DgcConfig {
    /// Create a config with defaults (disabled)
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the config from the process environment
    pub fn from_env() -> DgcResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from a key lookup.
    ///
    /// `OTTER_DGC_TTB` also resets `tta` to five times its value; an explicit
    /// `OTTER_DGC_TTA` wins over that.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DgcResult<Self> {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_ENABLED) {
            config.enabled = parse_bool(ENV_ENABLED, &raw)?;
        }
        if let Some(raw) = lookup(ENV_TTB) {
            config = config.ttb(Duration::from_millis(parse_u64(ENV_TTB, &raw)?));
        }
        if let Some(raw) = lookup(ENV_TTA) {
            config = config.tta(Duration::from_millis(parse_u64(ENV_TTA, &raw)?));
        }
        if let Some(raw) = lookup(ENV_CONSENSUS) {
            let rounds = parse_u64(ENV_CONSENSUS, &raw)?;
            let rounds = u32::try_from(rounds)
                .map_err(|_| DgcError::InvalidConfig(format!("{ENV_CONSENSUS} out of range")))?;
            config = config.required_consensus(rounds);
        }

        config.validate()?;
        Ok(config)
    }

    /// Enable or disable the DGC
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the tick period; resets `tta` to five times it
    pub fn ttb(mut self, ttb: Duration) -> Self {
        self.ttb = ttb;
        self.tta = ttb * TTA_FACTOR as u32;
        self
    }

    /// Set the alone/grace timeout
    pub fn tta(mut self, tta: Duration) -> Self {
        self.tta = tta;
        self
    }

    /// Set the number of consecutive consensus rounds
    pub fn required_consensus(mut self, rounds: u32) -> Self {
        self.required_consensus = rounds;
        self
    }

    /// Enable or disable startup jitter
    pub fn startup_jitter(mut self, enabled: bool) -> Self {
        self.startup_jitter = enabled;
        self
    }

    /// Set the send worker idle timeout
    pub fn send_idle_timeout(mut self, timeout: Duration) -> Self {
        self.send_idle_timeout = Some(timeout);
        self
    }

    /// Effective send worker idle timeout
    pub fn effective_send_idle_timeout(&self) -> Duration {
        self.send_idle_timeout.unwrap_or(self.tta * 2)
    }

    /// TTB in milliseconds
    pub fn ttb_ms(&self) -> i64 {
        self.ttb.as_millis() as i64
    }

    /// TTA in milliseconds
    pub fn tta_ms(&self) -> i64 {
        self.tta.as_millis() as i64
    }

    /// Check the timing assumptions
    pub fn validate(&self) -> DgcResult<()> {
        if self.ttb.is_zero() {
            return Err(DgcError::InvalidConfig("ttb must be positive".into()));
        }
        if self.tta <= self.ttb {
            return Err(DgcError::InvalidConfig(format!(
                "tta ({:?}) must exceed ttb ({:?})",
                self.tta, self.ttb
            )));
        }
        if self.required_consensus == 0 {
            return Err(DgcError::InvalidConfig(
                "required_consensus must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn parse_u64(key: &str, raw: &str) -> DgcResult<u64> {
    raw.trim()
        .parse()
        .map_err(|e| DgcError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

fn parse_bool(key: &str, raw: &str) -> DgcResult<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(DgcError::InvalidConfig(format!(
            "{key}={raw:?}: expected a boolean"
        ))),
    }
}

mod millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod opt_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = DgcConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.ttb, Duration::from_secs(30));
        assert_eq!(config.tta, Duration::from_secs(150));
        assert_eq!(config.required_consensus, 1);
        assert_eq!(config.effective_send_idle_timeout(), Duration::from_secs(300));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ttb_resets_tta() {
        let config = DgcConfig::new().ttb(Duration::from_millis(100));
        assert_eq!(config.tta_ms(), 500);
        let config = config.tta(Duration::from_millis(900));
        assert_eq!(config.tta_ms(), 900);
        assert_eq!(config.ttb_ms(), 100);
    }

    #[test]
    fn test_from_lookup() {
        let config = DgcConfig::from_lookup(lookup(&[
            (ENV_ENABLED, "true"),
            (ENV_TTB, "200"),
            (ENV_CONSENSUS, "3"),
        ]))
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.ttb_ms(), 200);
        assert_eq!(config.tta_ms(), 1000);
        assert_eq!(config.required_consensus, 3);

        let config =
            DgcConfig::from_lookup(lookup(&[(ENV_TTB, "200"), (ENV_TTA, "700")])).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.tta_ms(), 700);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        assert!(DgcConfig::from_lookup(lookup(&[(ENV_TTB, "soon")])).is_err());
        assert!(DgcConfig::from_lookup(lookup(&[(ENV_ENABLED, "maybe")])).is_err());
        assert!(DgcConfig::from_lookup(lookup(&[(ENV_CONSENSUS, "0")])).is_err());
        assert!(DgcConfig::from_lookup(lookup(&[(ENV_TTB, "100"), (ENV_TTA, "50")])).is_err());
    }

    #[test]
    fn test_deserialize_millis() {
        let config: DgcConfig =
            serde_json::from_str(r#"{"enabled": true, "ttb_ms": 1000, "tta_ms": 4000}"#).unwrap();
        assert!(config.enabled);
        assert_eq!(config.ttb, Duration::from_secs(1));
        assert_eq!(config.tta, Duration::from_secs(4));
        assert!(config.send_idle_timeout.is_none());
        assert!(config.startup_jitter);
    }
}
