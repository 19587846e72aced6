//! Platform-specific configuration paths.
//!
//! - **User config**: `~/.config/cadence/` (Linux), `~/Library/Application Support/cadence/` (macOS), `%APPDATA%\cadence\` (Windows)
//! - **Engine config file**: `engine.toml` inside the user config directory

use std::path::PathBuf;

use crate::ConfigError;

/// Application name used for directory paths.
const APP_NAME: &str = "cadence";

/// File name of the engine configuration.
const ENGINE_CONFIG_FILE: &str = "engine.toml";

/// Returns the user-specific configuration directory.
///
/// Returns a fallback path if the config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the default location of the engine configuration file.
pub fn default_config_path() -> PathBuf {
    user_config_dir().join(ENGINE_CONFIG_FILE)
}

/// Ensure the user config directory exists.
///
/// Creates the directory and any parent directories if they don't exist.
pub fn ensure_user_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = user_config_dir();

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::create_dir(&dir, e))?;
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_lives_in_app_dir() {
        let path = default_config_path();
        assert!(path.ends_with(PathBuf::from(APP_NAME).join(ENGINE_CONFIG_FILE)));
        assert_eq!(path.parent(), Some(user_config_dir().as_path()));
    }
}
