//! Various crate-wide constants.
use std::env;

use log::LevelFilter;

//------------ Environment Variables ----------------------------------------

/// The environment variable used to override the configured log level.
pub const PKCS11_DATA_ENV_LOG_LEVEL: &str = "PKCS11_DATA_LOG_LEVEL";

/// Returns the log level from the environment, if set and understood.
pub fn env_log_level() -> Option<LevelFilter> {
    let level = env::var(PKCS11_DATA_ENV_LOG_LEVEL).ok()?;
    match level.parse() {
        Ok(level) => Some(level),
        Err(_) => {
            eprintln!(
                "Unrecognized value for log level in env var {}",
                PKCS11_DATA_ENV_LOG_LEVEL
            );
            None
        }
    }
}

//------------ Defaults -----------------------------------------------------

pub const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::Info;

/// How many object handles to ask for per C_FindObjects call.
pub const FIND_OBJECTS_BATCH_SIZE: usize = 64;
