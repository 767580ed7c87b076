//! Configuration of tokens and logging.
use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use log::{LevelFilter, error};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, de};

use crate::constants::{DEFAULT_LOG_LEVEL, env_log_level};

//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn log_level() -> LevelFilter {
        env_log_level().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn tokens() -> Vec<TokenConfig> {
        Vec::new()
    }
}

//------------ Config --------------------------------------------------------

/// The configuration of the tokens to open sessions with and of logging.
///
/// ```toml
/// log_level = "info"
/// log_type = "file"
/// log_file = "/var/log/pkcs11-data.log"
///
/// [[tokens]]
/// name = "primary"
/// lib_path = "/usr/lib/softhsm/libsofthsm2.so"
/// slot = "My Token"
/// user_pin = "1234"
/// ```
#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default = "ConfigDefaults::tokens")]
    pub tokens: Vec<TokenConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: None,
            tokens: ConfigDefaults::tokens(),
        }
    }
}

impl Config {
    /// Reads and verifies the config file at `path`.
    pub fn parse(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ConfigError::Other(format!(
                "Cannot read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::parse_str(&content)
    }

    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        if let Some(level) = env_log_level() {
            config.log_level = level;
        }
        config.verify()?;
        Ok(config)
    }

    /// Returns the configuration of the token with the given name.
    pub fn token(&self, name: &str) -> Option<&TokenConfig> {
        self.tokens.iter().find(|token| token.name == name)
    }

    fn verify(&self) -> Result<(), ConfigError> {
        if self.log_type == LogType::File && self.log_file.is_none() {
            return Err(ConfigError::other(
                "log_type \"file\" requires a log_file",
            ));
        }
        for (i, token) in self.tokens.iter().enumerate() {
            if token.name.is_empty() {
                return Err(ConfigError::other("token name must not be empty"));
            }
            if self.tokens[..i].iter().any(|other| other.name == token.name) {
                return Err(ConfigError::Other(format!(
                    "duplicate token name '{}'",
                    token.name
                )));
            }
        }
        Ok(())
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::Stderr => self.stderr_logger(),
            LogType::File => match &self.log_file {
                Some(path) => self.file_logger(path),
                None => Err(ConfigError::other("no log_file configured")),
            },
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger().chain(io::stderr()).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init stderr logging: {}", e))
        })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}",
                    path.display(),
                    err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger().chain(file).apply().map_err(|e| {
            ConfigError::Other(format!("Failed to init file logging: {}", e))
        })
    }

    /// Creates and returns a fern logger.
    fn fern_logger(&self) -> fern::Dispatch {
        // PKCS#11 modules may log through the log crate as well, keep them
        // quieter than ourselves.
        let module_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                } else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(module_level)
            .level_for(env!("CARGO_CRATE_NAME"), self.log_level)
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    string.parse().map_err(de::Error::custom)
}

//------------ TokenConfig ---------------------------------------------------

/// How to reach one token.
#[derive(Debug, Deserialize)]
pub struct TokenConfig {
    /// The name callers use for the token.
    pub name: String,

    /// The PKCS#11 module to load.
    pub lib_path: PathBuf,

    /// The slot the token sits in.
    pub slot: SlotIdOrLabel,

    /// The user PIN. Without it, logging in depends on the prompt.
    #[serde(default)]
    pub user_pin: Option<SecretString>,
}

//------------ SlotIdOrLabel -------------------------------------------------

/// A slot, given either by its numeric id or by the label of its token.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum SlotIdOrLabel {
    Id(u64),
    Label(String),
}

impl fmt::Display for SlotIdOrLabel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SlotIdOrLabel::Id(id) => write!(f, "slot id {}", id),
            SlotIdOrLabel::Label(label) => write!(f, "slot label '{}'", label),
        }
    }
}

//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            _ => Err(de::Error::custom(format!(
                "expected \"stderr\" or \"file\", found : \"{}\"",
                string
            ))),
        }
    }
}

//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => e.fmt(f),
            ConfigError::TomlError(e) => e.fmt(f),
            ConfigError::Other(s) => s.fmt(f),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}

impl std::error::Error for ConfigError {}

//------------ Tests ---------------------------------------------------------
