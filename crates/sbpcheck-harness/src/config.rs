//! Harness configuration.
//!
//! Values are layered, with later layers overriding earlier ones: built-in defaults, an optional JSON file,
//! `SBPCHECK_*` environment variables, and finally command-line flags (applied by the runner binary).

use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use sbpcheck_core::DeviceType;

use crate::compare::Tolerance;
use crate::errors::ConfigError;

pub const ENV_SEED: &str = "SBPCHECK_SEED";
pub const ENV_WORLD_SIZE: &str = "SBPCHECK_WORLD_SIZE";
pub const ENV_NODE_SIZE: &str = "SBPCHECK_NODE_SIZE";
pub const ENV_CPU_ONLY: &str = "SBPCHECK_CPU_ONLY";
pub const ENV_REPEAT: &str = "SBPCHECK_REPEAT";
pub const ENV_RTOL: &str = "SBPCHECK_RTOL";
pub const ENV_ATOL: &str = "SBPCHECK_ATOL";
pub const ENV_CHECK_GRADIENTS: &str = "SBPCHECK_CHECK_GRADIENTS";
pub const ENV_CHECK_ALIASING: &str = "SBPCHECK_CHECK_ALIASING";

/// Largest supported world size. Extents are drawn as multiples of `lcm(4, world_size)` and broadcast tensors hold
/// one full copy per rank, so memory grows with the fourth power of the extents times the world size.
pub const MAX_WORLD_SIZE: usize = 8;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Seed of the whole run. A fresh seed is drawn when this is `None`.
    pub seed: Option<u64>,

    /// Number of simulated ranks.
    pub world_size: usize,

    /// Number of simulated nodes the ranks are spread over.
    pub node_size: usize,

    /// Restricts placements to CPU devices.
    pub cpu_only: bool,

    /// Number of test cases executed per configuration, each with its own seed.
    pub repeat: usize,

    pub rtol: f64,
    pub atol: f64,

    pub check_gradients: bool,
    pub check_aliasing: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        let tolerance = Tolerance::default();
        Self {
            seed: None,
            world_size: 4,
            node_size: 1,
            cpu_only: false,
            repeat: 1,
            rtol: tolerance.rtol,
            atol: tolerance.atol,
            check_gradients: true,
            check_aliasing: true,
        }
    }
}

impl HarnessConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Self::parse_json(json, "<string>")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|error| ConfigError::Io { path: path.display().to_string(), message: error.to_string() })?;
        Self::parse_json(json.as_str(), path.display().to_string().as_str())
    }

    fn parse_json(json: &str, path: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json)
            .map_err(|error| ConfigError::Parse { path: path.to_string(), message: error.to_string() })
    }

    /// Applies the `SBPCHECK_*` environment variables that are set.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|variable| std::env::var(variable).ok())
    }

    /// Applies overrides for the `SBPCHECK_*` variables that `lookup` resolves.
    pub fn with_overrides_from<F: Fn(&str) -> Option<String>>(mut self, lookup: F) -> Result<Self, ConfigError> {
        if let Some(seed) = parse_variable::<u64, _>(&lookup, ENV_SEED)? {
            self.seed = Some(seed);
        }
        override_with(&mut self.world_size, &lookup, ENV_WORLD_SIZE)?;
        override_with(&mut self.node_size, &lookup, ENV_NODE_SIZE)?;
        override_flag(&mut self.cpu_only, &lookup, ENV_CPU_ONLY)?;
        override_with(&mut self.repeat, &lookup, ENV_REPEAT)?;
        override_with(&mut self.rtol, &lookup, ENV_RTOL)?;
        override_with(&mut self.atol, &lookup, ENV_ATOL)?;
        override_flag(&mut self.check_gradients, &lookup, ENV_CHECK_GRADIENTS)?;
        override_flag(&mut self.check_aliasing, &lookup, ENV_CHECK_ALIASING)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.world_size == 0 {
            return Err(ConfigError::InvalidValue { key: "world_size", message: "must be positive".to_string() });
        }
        if self.world_size > MAX_WORLD_SIZE {
            return Err(ConfigError::InvalidValue {
                key: "world_size",
                message: format!("must be at most {MAX_WORLD_SIZE}, got {}", self.world_size),
            });
        }
        if self.node_size == 0 {
            return Err(ConfigError::InvalidValue { key: "node_size", message: "must be positive".to_string() });
        }
        if self.world_size % self.node_size != 0 {
            return Err(ConfigError::InvalidValue {
                key: "node_size",
                message: format!("must divide the world size ({})", self.world_size),
            });
        }
        if self.repeat == 0 {
            return Err(ConfigError::InvalidValue { key: "repeat", message: "must be positive".to_string() });
        }
        for (key, value) in [("rtol", self.rtol), ("atol", self.atol)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::InvalidValue { key, message: format!("must be finite and >= 0, got {value}") });
            }
        }
        Ok(())
    }

    pub fn environment(&self) -> Environment {
        Environment { world_size: self.world_size, node_size: self.node_size }
    }

    pub fn tolerance(&self) -> Tolerance {
        Tolerance { rtol: self.rtol, atol: self.atol }
    }

    /// Device types that placements are enumerated for.
    pub fn device_types(&self) -> Vec<DeviceType> {
        if self.cpu_only { vec![DeviceType::Cpu] } else { vec![DeviceType::Cuda, DeviceType::Cpu] }
    }
}

fn parse_variable<T: FromStr, F: Fn(&str) -> Option<String>>(
    lookup: &F,
    variable: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(variable) {
        None => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| ConfigError::InvalidEnvironmentVariable {
            variable: variable.to_string(),
            value,
        }),
    }
}

fn override_with<T: FromStr, F: Fn(&str) -> Option<String>>(
    target: &mut T,
    lookup: &F,
    variable: &str,
) -> Result<(), ConfigError> {
    if let Some(value) = parse_variable(lookup, variable)? {
        *target = value;
    }
    Ok(())
}

fn override_flag<F: Fn(&str) -> Option<String>>(
    target: &mut bool,
    lookup: &F,
    variable: &str,
) -> Result<(), ConfigError> {
    let Some(value) = lookup(variable) else {
        return Ok(());
    };
    *target = match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => return Err(ConfigError::InvalidEnvironmentVariable { variable: variable.to_string(), value }),
    };
    Ok(())
}

/// Simulated cluster that tests run on.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Environment {
    world_size: usize,
    node_size: usize,
}

impl Environment {
    pub fn new(world_size: usize, node_size: usize) -> Result<Self, ConfigError> {
        let config = HarnessConfig { world_size, node_size, ..HarnessConfig::default() };
        config.validate()?;
        Ok(config.environment())
    }

    /// Total number of ranks.
    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// Number of nodes.
    pub fn node_size(&self) -> usize {
        self.node_size
    }

    /// Number of ranks on each node.
    pub fn ranks_per_node(&self) -> usize {
        self.world_size / self.node_size.max(1)
    }
}
