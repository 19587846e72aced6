//! Error types for configuration operations.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while loading, saving, or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a file
    #[error("failed to read file '{path}': {source}")]
    ReadFile {
        /// Path of the file that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to write a file
    #[error("failed to write file '{path}': {source}")]
    WriteFile {
        /// Path of the file that could not be written.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to create directory
    #[error("failed to create directory '{path}': {source}")]
    CreateDir {
        /// Path of the directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// A setting is out of range
    #[error("invalid setting '{key}': {reason}")]
    Invalid {
        /// Dotted key of the offending setting, e.g. `buffers.device`.
        key: String,
        /// Why the value was rejected.
        reason: String,
    },
}

impl ConfigError {
    /// Create a read file error.
    pub fn read_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::ReadFile {
            path: path.into(),
            source,
        }
    }

    /// Create a write file error.
    pub fn write_file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::WriteFile {
            path: path.into(),
            source,
        }
    }

    /// Create a create directory error.
    pub fn create_dir(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ConfigError::CreateDir {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid setting error.
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    fn mock_io_err() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "mock")
    }

    #[test]
    fn factories_produce_matching_variants() {
        let err = ConfigError::read_file("/a/engine.toml", mock_io_err());
        assert!(
            matches!(err, ConfigError::ReadFile { ref path, .. } if path == std::path::Path::new("/a/engine.toml"))
        );
        assert!(matches!(
            ConfigError::write_file("/b", mock_io_err()),
            ConfigError::WriteFile { .. }
        ));
        assert!(matches!(
            ConfigError::create_dir("/c", mock_io_err()),
            ConfigError::CreateDir { .. }
        ));
    }

    #[test]
    fn display_names_the_path() {
        let msg = ConfigError::read_file("/a/engine.toml", mock_io_err()).to_string();
        assert!(msg.contains("failed to read file"), "got: {msg}");
        assert!(msg.contains("/a/engine.toml"), "got: {msg}");

        let msg = ConfigError::create_dir("/cfg", mock_io_err()).to_string();
        assert!(msg.contains("failed to create directory"), "got: {msg}");
    }

    #[test]
    fn invalid_display() {
        let err = ConfigError::invalid("buffers.device", "must be -1 (cpu) or a device index");
        assert_eq!(
            err.to_string(),
            "invalid setting 'buffers.device': must be -1 (cpu) or a device index"
        );
    }

    #[test]
    fn io_variants_expose_source() {
        assert!(ConfigError::read_file("/x", mock_io_err()).source().is_some());
        assert!(ConfigError::write_file("/x", mock_io_err()).source().is_some());
        assert!(ConfigError::create_dir("/x", mock_io_err()).source().is_some());
        assert!(ConfigError::invalid("k", "r").source().is_none());
    }
}
