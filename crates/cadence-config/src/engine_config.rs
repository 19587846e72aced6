//! Engine configuration file format.

use serde::{Deserialize, Serialize};
use std::path::Path;

use cadence_core::{DeviceId, EngineOptions, Network, PairingPolicy};

use crate::error::ConfigError;

/// Engine configuration, one TOML table per concern.
///
/// Every table and every key is optional; anything missing takes the
/// engine default.
///
/// # TOML Format
///
/// ```toml
/// [planner]
/// pairing = "skip-during-discovery"   # or "traverse"
///
/// [buffers]
/// reuse = true
/// device = -1                         # -1 = cpu
///
/// [execution]
/// skip_up_to_date = true
/// mask_gaps = true
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Loop discovery and ordering.
    pub planner: PlannerConfig,
    /// Intermediate buffer handling.
    pub buffers: BufferConfig,
    /// Forward pass switches.
    pub execution: ExecutionConfig,
}

/// `[planner]` table.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// How loop discovery treats pairing nodes.
    pub pairing: PairingMode,
}

/// Serialized form of [`PairingPolicy`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PairingMode {
    /// Cut the input edges of pairing nodes during loop discovery.
    #[default]
    SkipDuringDiscovery,
    /// Treat pairing nodes as ordinary nodes.
    Traverse,
}

impl From<PairingMode> for PairingPolicy {
    fn from(mode: PairingMode) -> Self {
        match mode {
            PairingMode::SkipDuringDiscovery => PairingPolicy::SkipDuringDiscovery,
            PairingMode::Traverse => PairingPolicy::Traverse,
        }
    }
}

impl From<PairingPolicy> for PairingMode {
    fn from(policy: PairingPolicy) -> Self {
        match policy {
            PairingPolicy::SkipDuringDiscovery => PairingMode::SkipDuringDiscovery,
            PairingPolicy::Traverse => PairingMode::Traverse,
        }
    }
}

/// `[buffers]` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BufferConfig {
    /// Recycle intermediate buffers once their last consumer has run.
    pub reuse: bool,
    /// Device new buffers are requested on; `-1` is host memory.
    pub device: i32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            reuse: true,
            device: DeviceId::CPU.0,
        }
    }
}

/// `[execution]` table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Skip precomputed nodes whose value is newer than all their inputs.
    pub skip_up_to_date: bool,
    /// Zero gap frames after each step of a recurrent loop.
    pub mask_gaps: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            skip_up_to_date: true,
            mask_gaps: true,
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Load a configuration, falling back to defaults if the file does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Save the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }

        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every setting is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffers.device < DeviceId::CPU.0 {
            return Err(ConfigError::invalid(
                "buffers.device",
                format!(
                    "{} is not a device; use -1 for cpu or a device index",
                    self.buffers.device
                ),
            ));
        }
        Ok(())
    }

    /// Engine options described by this configuration.
    pub fn to_options(&self) -> EngineOptions {
        EngineOptions {
            pairing: self.planner.pairing.into(),
            reuse_buffers: self.buffers.reuse,
            device: DeviceId(self.buffers.device),
            skip_up_to_date: self.execution.skip_up_to_date,
            mask_gaps: self.execution.mask_gaps,
        }
    }

    /// Consumes the configuration, returning its engine options.
    pub fn into_options(self) -> EngineOptions {
        self.to_options()
    }

    /// Validates the configuration and installs it on `net`.
    pub fn apply(&self, net: &mut Network) -> Result<(), ConfigError> {
        self.validate()?;
        net.set_options(self.to_options());
        Ok(())
    }
}

impl From<&EngineOptions> for EngineConfig {
    fn from(options: &EngineOptions) -> Self {
        Self {
            planner: PlannerConfig {
                pairing: options.pairing.into(),
            },
            buffers: BufferConfig {
                reuse: options.reuse_buffers,
                device: options.device.0,
            },
            execution: ExecutionConfig {
                skip_up_to_date: options.skip_up_to_date,
                mask_gaps: options.mask_gaps,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_gives_engine_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.into_options(), EngineOptions::default());
    }

    #[test]
    fn partial_tables_keep_remaining_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [execution]
            mask_gaps = false
            "#,
        )
        .unwrap();
        assert!(!config.execution.mask_gaps);
        assert!(config.execution.skip_up_to_date);
        assert!(config.buffers.reuse);
        assert_eq!(config.planner.pairing, PairingMode::SkipDuringDiscovery);
    }

    #[test]
    fn pairing_uses_kebab_case() {
        let config = EngineConfig::from_toml("[planner]\npairing = \"traverse\"\n").unwrap();
        assert_eq!(config.to_options().pairing, PairingPolicy::Traverse);

        let err = EngineConfig::from_toml("[planner]\npairing = \"Traverse\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::TomlParse(_)));
    }

    #[test]
    fn device_below_cpu_is_invalid() {
        let err = EngineConfig::from_toml("[buffers]\ndevice = -2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "buffers.device"));

        let config = EngineConfig::from_toml("[buffers]\ndevice = 1\n").unwrap();
        assert_eq!(config.to_options().device, DeviceId(1));
    }

    #[test]
    fn serialized_form_reads_back() {
        let options = EngineOptions {
            pairing: PairingPolicy::Traverse,
            reuse_buffers: false,
            device: DeviceId(0),
            skip_up_to_date: false,
            mask_gaps: true,
        };
        let text = EngineConfig::from(&options).to_toml().unwrap();
        assert!(text.contains("pairing = \"traverse\""), "got:\n{text}");
        assert_eq!(EngineConfig::from_toml(&text).unwrap().into_options(), options);
    }
}
