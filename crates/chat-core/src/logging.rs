//! Logging setup shared by the chatterbox binaries.
//!
//! Both binaries log to stderr through a `tracing_subscriber::fmt`
//! subscriber. `CHATTERBOX_LOG` picks the verbosity (`off`, `error`, `warn`,
//! `info`, `debug`, `trace`, or `0`-`5`); each binary supplies its own default
//! because the client shares the terminal with chat output.

use std::sync::OnceLock;

use tracing::level_filters::LevelFilter;

/// Environment variable selecting the log level.
pub const LOG_ENV: &str = "CHATTERBOX_LOG";

/// Server default: connection and session lifecycle events.
pub const SERVER_DEFAULT: LevelFilter = LevelFilter::INFO;

/// Client default: only problems.
pub const CLIENT_DEFAULT: LevelFilter = LevelFilter::WARN;

static INIT: OnceLock<LevelFilter> = OnceLock::new();

fn level_from(raw: Option<&str>, default: LevelFilter) -> LevelFilter {
    match raw.map(str::trim).filter(|raw| !raw.is_empty()) {
        Some(raw) => raw.parse().unwrap_or(default),
        None => default,
    }
}

/// Install the stderr subscriber and return the level in effect.
///
/// Only the first call installs anything; later calls return the level
/// chosen then, whatever `default` they pass.
pub fn init(default: LevelFilter) -> LevelFilter {
    *INIT.get_or_init(|| {
        let level = level_from(std::env::var(LOG_ENV).ok().as_deref(), default);
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
        level
    })
}
