//! Configuration types and environment overrides

use std::env;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RotaryError};
use crate::style::RotaryStyle;

/// Total rotated pairs below which a call stays on the calling thread.
pub const DEFAULT_SERIAL_THRESHOLD: usize = 4096;
/// Minimum number of tokens handed to one rayon task.
pub const DEFAULT_MIN_TOKENS_PER_TASK: usize = 1;
/// Upper bound on the lanes reported per token, matching the device launch cap.
pub const DEFAULT_MAX_LANES_PER_TOKEN: usize = 512;

const ENV_SERIAL_THRESHOLD: &str = "ROPEKIT_SERIAL_THRESHOLD";
const ENV_MIN_TOKENS_PER_TASK: &str = "ROPEKIT_MIN_TOKENS_PER_TASK";
const ENV_MAX_LANES: &str = "ROPEKIT_MAX_LANES";
const ENV_FORCE_SERIAL: &str = "ROPEKIT_FORCE_SERIAL";

static GLOBAL_PARALLEL_CONFIG: OnceLock<ParallelConfig> = OnceLock::new();

/// Work distribution settings for the CPU kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub serial_threshold: usize,
    pub min_tokens_per_task: usize,
    pub max_lanes_per_token: usize,
    pub force_serial: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            serial_threshold: DEFAULT_SERIAL_THRESHOLD,
            min_tokens_per_task: DEFAULT_MIN_TOKENS_PER_TASK,
            max_lanes_per_token: DEFAULT_MAX_LANES_PER_TOKEN,
            force_serial: false,
        }
    }
}

impl ParallelConfig {
    /// A configuration that never leaves the calling thread.
    #[must_use]
    pub fn serial() -> Self {
        Self { force_serial: true, ..Self::default() }
    }

    /// A configuration that always fans out across the rayon pool.
    #[must_use]
    pub fn always_parallel() -> Self {
        Self { serial_threshold: 0, ..Self::default() }
    }

    #[must_use]
    pub fn with_serial_threshold(mut self, threshold: usize) -> Self {
        self.serial_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_min_tokens_per_task(mut self, tokens: usize) -> Self {
        self.min_tokens_per_task = tokens.max(1);
        self
    }

    #[must_use]
    pub fn with_max_lanes_per_token(mut self, lanes: usize) -> Self {
        self.max_lanes_per_token = lanes.max(1);
        self
    }

    /// Whether a call touching `total_pairs` rotation pairs should run serially.
    #[must_use]
    pub fn runs_serial(&self, total_pairs: usize) -> bool {
        self.force_serial || total_pairs < self.serial_threshold
    }

    /// Build a configuration from environment variables, rejecting malformed values.
    pub fn try_from_env() -> Result<Self> {
        Self::try_from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from environment variables.
    ///
    /// Malformed values are logged and replaced by their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`ParallelConfig::try_from_env`], reading variables through `lookup`.
    pub fn try_from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(v) = parse_usize(&lookup, ENV_SERIAL_THRESHOLD)? {
            config.serial_threshold = v;
        }
        if let Some(v) = parse_usize(&lookup, ENV_MIN_TOKENS_PER_TASK)? {
            config.min_tokens_per_task = nonzero(ENV_MIN_TOKENS_PER_TASK, v)?;
        }
        if let Some(v) = parse_usize(&lookup, ENV_MAX_LANES)? {
            config.max_lanes_per_token = nonzero(ENV_MAX_LANES, v)?;
        }
        if let Some(v) = parse_bool(&lookup, ENV_FORCE_SERIAL)? {
            config.force_serial = v;
        }
        Ok(config)
    }

    /// Like [`ParallelConfig::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let mut config = defaults.clone();

        match parse_usize(&lookup, ENV_SERIAL_THRESHOLD) {
            Ok(Some(v)) => config.serial_threshold = v,
            Ok(None) => {}
            Err(e) => log::warn!("{e}; using {}", defaults.serial_threshold),
        }
        match parse_usize(&lookup, ENV_MIN_TOKENS_PER_TASK)
            .and_then(|v| v.map(|v| nonzero(ENV_MIN_TOKENS_PER_TASK, v)).transpose())
        {
            Ok(Some(v)) => config.min_tokens_per_task = v,
            Ok(None) => {}
            Err(e) => log::warn!("{e}; using {}", defaults.min_tokens_per_task),
        }
        match parse_usize(&lookup, ENV_MAX_LANES)
            .and_then(|v| v.map(|v| nonzero(ENV_MAX_LANES, v)).transpose())
        {
            Ok(Some(v)) => config.max_lanes_per_token = v,
            Ok(None) => {}
            Err(e) => log::warn!("{e}; using {}", defaults.max_lanes_per_token),
        }
        match parse_bool(&lookup, ENV_FORCE_SERIAL) {
            Ok(Some(v)) => config.force_serial = v,
            Ok(None) => {}
            Err(e) => log::warn!("{e}; using {}", defaults.force_serial),
        }
        config
    }

    /// Process-wide configuration, read from the environment on first use.
    pub fn global() -> &'static ParallelConfig {
        GLOBAL_PARALLEL_CONFIG.get_or_init(Self::from_env)
    }
}

fn parse_usize<F>(lookup: &F, var: &'static str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim().parse::<usize>().map(Some).map_err(|e| RotaryError::Config {
        var,
        value: raw.clone(),
        reason: e.to_string(),
    })
}

fn parse_bool<F>(lookup: &F, var: &'static str) -> Result<Option<bool>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
        _ => Err(RotaryError::Config {
            var,
            value: raw.clone(),
            reason: "expected a boolean".into(),
        }),
    }
}

fn nonzero(var: &'static str, value: usize) -> Result<usize> {
    if value == 0 {
        return Err(RotaryError::Config {
            var,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

/// Parameters a rotary layer is built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotaryConfig {
    /// Total per-head width; the rotated span is the cache's `rot_dim`.
    pub head_size: usize,
    #[serde(default)]
    pub style: RotaryStyle,
    #[serde(default)]
    pub parallel: ParallelConfig,
}

impl RotaryConfig {
    #[must_use]
    pub fn new(head_size: usize, style: RotaryStyle) -> Self {
        Self { head_size, style, parallel: ParallelConfig::global().clone() }
    }

    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Check the parameters that do not depend on a particular call.
    pub fn validate(&self) -> Result<()> {
        if self.head_size == 0 {
            return Err(RotaryError::ZeroHeadSize);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = ParallelConfig::try_from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ParallelConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = ParallelConfig::try_from_lookup(lookup(&[
            ("ROPEKIT_SERIAL_THRESHOLD", "128"),
            ("ROPEKIT_MIN_TOKENS_PER_TASK", "4"),
            ("ROPEKIT_MAX_LANES", "256"),
            ("ROPEKIT_FORCE_SERIAL", "true"),
        ]))
        .unwrap();
        assert_eq!(config.serial_threshold, 128);
        assert_eq!(config.min_tokens_per_task, 4);
        assert_eq!(config.max_lanes_per_token, 256);
        assert!(config.force_serial);
    }

    #[test]
    fn malformed_values_are_rejected_strictly() {
        let err = ParallelConfig::try_from_lookup(lookup(&[("ROPEKIT_SERIAL_THRESHOLD", "lots")]))
            .unwrap_err();
        assert!(matches!(err, RotaryError::Config { var: "ROPEKIT_SERIAL_THRESHOLD", .. }));

        let err = ParallelConfig::try_from_lookup(lookup(&[("ROPEKIT_MAX_LANES", "0")]))
            .unwrap_err();
        assert!(matches!(err, RotaryError::Config { var: "ROPEKIT_MAX_LANES", .. }));

        let err = ParallelConfig::try_from_lookup(lookup(&[("ROPEKIT_FORCE_SERIAL", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, RotaryError::Config { var: "ROPEKIT_FORCE_SERIAL", .. }));
    }

    #[test]
    fn malformed_values_fall_back_leniently() {
        let config = ParallelConfig::from_lookup(lookup(&[
            ("ROPEKIT_SERIAL_THRESHOLD", "-3"),
            ("ROPEKIT_MIN_TOKENS_PER_TASK", "0"),
            ("ROPEKIT_FORCE_SERIAL", "1"),
        ]));
        assert_eq!(config.serial_threshold, DEFAULT_SERIAL_THRESHOLD);
        assert_eq!(config.min_tokens_per_task, DEFAULT_MIN_TOKENS_PER_TASK);
        assert!(config.force_serial);
    }

    #[test]
    fn serial_decision() {
        let config = ParallelConfig::default().with_serial_threshold(100);
        assert!(config.runs_serial(99));
        assert!(!config.runs_serial(100));
        assert!(ParallelConfig::serial().runs_serial(usize::MAX));
        assert!(!ParallelConfig::always_parallel().runs_serial(0));
    }

    #[test]
    fn builders_clamp_to_one() {
        let config = ParallelConfig::default().with_min_tokens_per_task(0).with_max_lanes_per_token(0);
        assert_eq!(config.min_tokens_per_task, 1);
        assert_eq!(config.max_lanes_per_token, 1);
    }

    #[test]
    fn rotary_config_rejects_zero_head_size() {
        let config = RotaryConfig::new(0, RotaryStyle::Neox);
        assert_eq!(config.validate(), Err(RotaryError::ZeroHeadSize));
        assert!(RotaryConfig::new(64, RotaryStyle::GptJ).validate().is_ok());
    }
}
