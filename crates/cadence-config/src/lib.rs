//! Engine configuration for cadence computation graphs.
//!
//! Loads and saves the tuning knobs of a [`cadence_core::Network`] as TOML:
//! how loop discovery treats pairing nodes, whether intermediate buffers are
//! recycled and on which device, and the execution switches for skipping
//! up-to-date nodes and masking gap frames.
//!
//! # Example
//!
//! ```rust
//! use cadence_config::EngineConfig;
//! use cadence_core::{Network, PairingPolicy};
//!
//! let config = EngineConfig::from_toml(
//!     r#"
//!     [planner]
//!     pairing = "traverse"
//!
//!     [buffers]
//!     reuse = false
//!     "#,
//! )
//! .unwrap();
//!
//! let mut net = Network::new();
//! config.apply(&mut net).unwrap();
//! assert_eq!(net.options().pairing, PairingPolicy::Traverse);
//! assert!(!net.options().reuse_buffers);
//! assert!(net.options().mask_gaps);
//! ```

mod engine_config;
mod error;

/// Platform-specific configuration paths.
pub mod paths;

pub use engine_config::{BufferConfig, EngineConfig, ExecutionConfig, PairingMode, PlannerConfig};
pub use error::ConfigError;
pub use paths::{default_config_path, ensure_user_config_dir, user_config_dir};
