//! Configuration resolution
//!
//! Resolves server configuration from multiple sources with priority:
//! 1. Command-line arguments (passed as parameters)
//! 2. Environment variables
//! 3. Config file (`CHATTERBOX_CONFIG`, else `./chatterbox.toml`)
//! 4. Defaults

mod discovery;
mod types;

pub use discovery::{
    CONFIG_ENV, ConfigError, ConfigOverrides, LOCAL_CONFIG_FILE, load_config_file, resolve_config,
};
pub use types::{IdentityConfig, ListenConfig, ServerConfig, SessionConfig};
