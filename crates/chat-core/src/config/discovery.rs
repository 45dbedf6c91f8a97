//! Configuration discovery and resolution

use super::types::ServerConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CHATTERBOX_CONFIG";

/// Config file picked up from the working directory.
pub const LOCAL_CONFIG_FILE: &str = "chatterbox.toml";

const BIND_ENV: &str = "CHATTERBOX_BIND";
const MAX_LINE_ENV: &str = "CHATTERBOX_MAX_LINE";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("TOML parsing error in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A value is out of range
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Listening port from the command line
    pub port: Option<u16>,
    /// Explicit config file path (takes precedence over `CHATTERBOX_CONFIG`)
    pub config_path: Option<PathBuf>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables
/// 3. Explicit config file, else `chatterbox.toml` in `current_dir`
/// 4. Defaults
///
/// An explicitly named file must load; a discovered one that fails to parse
/// is skipped with a warning.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    current_dir: &Path,
) -> Result<ServerConfig, ConfigError> {
    let explicit = overrides
        .config_path
        .clone()
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

    let mut config = match explicit {
        Some(path) => load_config_file(&path)?,
        None => {
            let local = current_dir.join(LOCAL_CONFIG_FILE);
            if local.exists() {
                load_config_file(&local).unwrap_or_else(|e| {
                    warn!("Ignoring config at {}: {e}", local.display());
                    ServerConfig::default()
                })
            } else {
                ServerConfig::default()
            }
        }
    };

    apply_env_overrides(&mut config)?;
    apply_cli_overrides(&mut config, overrides);
    validate(&config)?;

    debug!(?config, "Resolved configuration");
    Ok(config)
}

/// Load config from a TOML file
pub fn load_config_file(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut ServerConfig) -> Result<(), ConfigError> {
    if let Ok(bind) = std::env::var(BIND_ENV) {
        config.listen.bind = bind;
    }

    if let Ok(raw) = std::env::var(MAX_LINE_ENV) {
        config.session.max_line_length = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{MAX_LINE_ENV}={raw} is not a number")))?;
    }

    Ok(())
}

/// Apply command-line overrides
fn apply_cli_overrides(config: &mut ServerConfig, overrides: &ConfigOverrides) {
    if let Some(port) = overrides.port {
        config.listen.port = port;
    }
}

fn validate(config: &ServerConfig) -> Result<(), ConfigError> {
    if config.session.max_line_length == 0 {
        return Err(ConfigError::Invalid(
            "session.max_line_length must be positive".to_string(),
        ));
    }
    if config.identity.max_attempts == 0 {
        return Err(ConfigError::Invalid(
            "identity.max_attempts must be positive".to_string(),
        ));
    }
    Ok(())
}
