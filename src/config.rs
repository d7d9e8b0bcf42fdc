//! Configuration: which PKCS#11 library and slot to use, how to log in and how to size and time the session pool.
use std::{
    fmt,
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use log::{LevelFilter, error};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer, de};

use crate::token::SlotIdOrLabel;

//------------ ConfigDefaults ----------------------------------------------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn login_mode() -> LoginMode {
        LoginMode::LoginRequired
    }

    fn max_sessions() -> u32 {
        8
    }

    fn acquire_timeout_secs() -> u64 {
        30
    }

    fn max_random_bytes_per_call() -> usize {
        1024
    }

    fn retry_initial_interval_ms() -> u64 {
        50
    }

    fn retry_multiplier() -> f64 {
        1.5
    }

    fn retry_max_elapsed_ms() -> u64 {
        5000
    }

    fn log_level() -> LevelFilter {
        LevelFilter::Info
    }

    fn log_type() -> LogType {
        LogType::Stderr
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./p11keys.log")
    }
}

//------------ LoginMode ---------------------------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum LoginMode {
    /// The token can sign and generate keys without C_Login being called first, so no user PIN is needed either.
    LoginNotRequired,

    /// C_Login must be called before any cryptographic operation. A user PIN may be needed for it to succeed.
    LoginRequired,
}

//------------ LogType -----------------------------------------------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
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

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}

//------------ Config ------------------------------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Path to the PKCS#11 library. Only needed when the context loads the library itself.
    #[serde(default)]
    pub lib_path: Option<PathBuf>,

    pub slot: SlotIdOrLabel,

    #[serde(default)]
    pub user_pin: Option<SecretString>,

    #[serde(default = "ConfigDefaults::login_mode")]
    pub login_mode: LoginMode,

    /// Upper bound on the number of sessions open at the same time.
    #[serde(default = "ConfigDefaults::max_sessions")]
    pub max_sessions: u32,

    #[serde(default = "ConfigDefaults::acquire_timeout_secs")]
    pub acquire_timeout_secs: u64,

    #[serde(default = "ConfigDefaults::max_random_bytes_per_call")]
    pub max_random_bytes_per_call: usize,

    #[serde(default = "ConfigDefaults::retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,

    #[serde(default = "ConfigDefaults::retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "ConfigDefaults::retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,

    #[serde(default = "ConfigDefaults::log_level", deserialize_with = "de_level_filter")]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,
}

impl Config {
    /// A configuration with defaults for everything but the slot.
    pub fn new(slot: SlotIdOrLabel) -> Self {
        Config {
            lib_path: None,
            slot,
            user_pin: None,
            login_mode: ConfigDefaults::login_mode(),
            max_sessions: ConfigDefaults::max_sessions(),
            acquire_timeout_secs: ConfigDefaults::acquire_timeout_secs(),
            max_random_bytes_per_call: ConfigDefaults::max_random_bytes_per_call(),
            retry_initial_interval_ms: ConfigDefaults::retry_initial_interval_ms(),
            retry_multiplier: ConfigDefaults::retry_multiplier(),
            retry_max_elapsed_ms: ConfigDefaults::retry_max_elapsed_ms(),
            log_level: ConfigDefaults::log_level(),
            log_type: ConfigDefaults::log_type(),
            log_file: ConfigDefaults::log_file(),
        }
    }

    pub fn read_config(file: &Path) -> Result<Self, ConfigError> {
        let mut v = String::new();
        let mut f = File::open(file)?;
        f.read_to_string(&mut v)?;

        let c: Config = toml::from_str(&v)?;
        c.verify()?;
        Ok(c)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if self.max_sessions == 0 {
            return Err(ConfigError::other("max_sessions must be greater than zero"));
        }
        if self.acquire_timeout_secs == 0 {
            return Err(ConfigError::other("acquire_timeout_secs must be greater than zero"));
        }
        if self.max_random_bytes_per_call == 0 {
            return Err(ConfigError::other("max_random_bytes_per_call must be greater than zero"));
        }
        if self.retry_multiplier < 1.0 {
            return Err(ConfigError::other("retry_multiplier must be at least 1.0"));
        }
        if self.login_mode == LoginMode::LoginNotRequired && self.user_pin.is_some() {
            return Err(ConfigError::other("user_pin is set but login_mode is login_not_required"));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn retry_initial_interval(&self) -> Duration {
        Duration::from_millis(self.retry_initial_interval_ms)
    }

    pub fn retry_max_elapsed(&self) -> Duration {
        Duration::from_millis(self.retry_max_elapsed_ms)
    }

    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init stderr logging: {}", e)))
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!("Failed to open log file '{}': {}", path.display(), err);
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| ConfigError::Other(format!("Failed to init file logging: {}", e)))
    }

    fn fern_logger(&self) -> fern::Dispatch {
        // r2d2 reports every failed session open at error level, which is too noisy while a token is away
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace || self.log_level == LevelFilter::Debug;
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
            .level(self.log_level)
            .level_for("r2d2", framework_level)
    }
}

//------------ ConfigError -------------------------------------------------------------------------------------------

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

impl std::error::Error for ConfigError {}

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
