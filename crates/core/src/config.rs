//! Runtime configuration.
//!
//! Values are resolved with the following priority:
//! 1. Environment variables (highest priority)
//! 2. Config file (TOML, loaded explicitly with [`RuntimeConfig::load_from`])
//! 3. Default values (lowest priority)
//!
//! | Setting | Environment | Default |
//! |---|---|---|
//! | `local_size` | `LOCAL_SIZE` | device count |
//! | `use_nvrtc` | `USE_NVRTC` (integer, non-zero enables) | `false` |
//! | `sdk_home` | `CUDA_HOME`, then `CUDA_PATH` | `/usr/local/cuda` |
//! | `max_num_split` | `EXPERTLINK_MAX_NUM_SPLIT` | 8 |
//! | `rendezvous_timeout_secs` | `EXPERTLINK_RENDEZVOUS_TIMEOUT_SECS` | 300 |
//! | `fallback_log` | `EXPERTLINK_FALLBACK_LOG` (`silent`, `once`, `always`) | `once` |
//! | `master_addr` | `MASTER_ADDR` | `127.0.0.1` |
//! | `master_port` | `MASTER_PORT` | 29500 |

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SDK_HOME: &str = "/usr/local/cuda";
pub const DEFAULT_MAX_NUM_SPLIT: usize = 8;
pub const DEFAULT_RENDEZVOUS_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_MASTER_ADDR: &str = "127.0.0.1";
pub const DEFAULT_MASTER_PORT: u16 = 29500;

/// How often a fallback (compiler backend or exchange path) is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackLog {
    /// Never log fallbacks.
    Silent,
    /// Log the first fallback of each kind, then stay quiet.
    #[default]
    Once,
    /// Log every fallback.
    Always,
}

impl FromStr for FallbackLog {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "silent" | "off" => Ok(Self::Silent),
            "once" => Ok(Self::Once),
            "always" => Ok(Self::Always),
            other => Err(format!("unknown fallback log mode `{other}`")),
        }
    }
}

/// Configuration of the exchange runtime.
///
/// Every field is optional so that partial sources (file, environment) can be
/// merged; accessors apply the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Devices per node. Defaults to the platform's device count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_size: Option<usize>,

    /// Skip the ahead-of-time compiler and go straight to NVRTC.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_nvrtc: Option<bool>,

    /// CUDA toolkit location (nvcc and headers).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_home: Option<PathBuf>,

    /// Capacity of the event pool; upper bound on `num_split`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_num_split: Option<usize>,

    /// Bound on communicator establishment, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rendezvous_timeout_secs: Option<u64>,

    /// Fallback logging verbosity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_log: Option<FallbackLog>,

    /// Address of rank 0 for the TCP id exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_addr: Option<String>,

    /// Port of rank 0 for the TCP id exchange.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_port: Option<u16>,
}

impl RuntimeConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Config file merged with the process environment.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from(path)?,
            None => Self::default(),
        };
        config.merge(&Self::from_env()?);
        Ok(config)
    }

    /// Build from an arbitrary variable lookup (environment, test fixtures).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        fn parse<T: FromStr>(var: &str, value: Option<String>) -> Result<Option<T>, ConfigError> {
            value
                .map(|v| {
                    v.trim().parse::<T>().map_err(|_| ConfigError::InvalidEnv {
                        var: var.to_string(),
                        value: v,
                    })
                })
                .transpose()
        }

        let use_nvrtc: Option<i64> = parse("USE_NVRTC", lookup("USE_NVRTC"))?;
        let fallback_log = lookup("EXPERTLINK_FALLBACK_LOG")
            .map(|v| {
                v.parse::<FallbackLog>().map_err(|_| ConfigError::InvalidEnv {
                    var: "EXPERTLINK_FALLBACK_LOG".to_string(),
                    value: v,
                })
            })
            .transpose()?;

        Ok(Self {
            local_size: parse("LOCAL_SIZE", lookup("LOCAL_SIZE"))?,
            use_nvrtc: use_nvrtc.map(|v| v != 0),
            sdk_home: lookup("CUDA_HOME")
                .or_else(|| lookup("CUDA_PATH"))
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            max_num_split: parse("EXPERTLINK_MAX_NUM_SPLIT", lookup("EXPERTLINK_MAX_NUM_SPLIT"))?,
            rendezvous_timeout_secs: parse(
                "EXPERTLINK_RENDEZVOUS_TIMEOUT_SECS",
                lookup("EXPERTLINK_RENDEZVOUS_TIMEOUT_SECS"),
            )?,
            fallback_log,
            master_addr: lookup("MASTER_ADDR").filter(|s| !s.is_empty()),
            master_port: parse("MASTER_PORT", lookup("MASTER_PORT"))?,
        })
    }

    /// Load configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(ConfigError::Parse)
    }

    /// Save configuration to a TOML file.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(ConfigError::Io)?;
        }
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;
        fs::write(path, content).map_err(ConfigError::Io)
    }

    /// Merge with another config, preferring values from `other`.
    pub fn merge(&mut self, other: &RuntimeConfig) {
        if other.local_size.is_some() {
            self.local_size = other.local_size;
        }
        if other.use_nvrtc.is_some() {
            self.use_nvrtc = other.use_nvrtc;
        }
        if other.sdk_home.is_some() {
            self.sdk_home = other.sdk_home.clone();
        }
        if other.max_num_split.is_some() {
            self.max_num_split = other.max_num_split;
        }
        if other.rendezvous_timeout_secs.is_some() {
            self.rendezvous_timeout_secs = other.rendezvous_timeout_secs;
        }
        if other.fallback_log.is_some() {
            self.fallback_log = other.fallback_log;
        }
        if other.master_addr.is_some() {
            self.master_addr = other.master_addr.clone();
        }
        if other.master_port.is_some() {
            self.master_port = other.master_port;
        }
    }

    pub fn use_nvrtc(&self) -> bool {
        self.use_nvrtc.unwrap_or(false)
    }

    pub fn sdk_home(&self) -> PathBuf {
        self.sdk_home
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SDK_HOME))
    }

    pub fn max_num_split(&self) -> usize {
        self.max_num_split.unwrap_or(DEFAULT_MAX_NUM_SPLIT)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(
            self.rendezvous_timeout_secs
                .unwrap_or(DEFAULT_RENDEZVOUS_TIMEOUT_SECS),
        )
    }

    pub fn fallback_log(&self) -> FallbackLog {
        self.fallback_log.unwrap_or_default()
    }

    pub fn master_addr(&self) -> String {
        self.master_addr
            .clone()
            .unwrap_or_else(|| DEFAULT_MASTER_ADDR.to_string())
    }

    pub fn master_port(&self) -> u16 {
        self.master_port.unwrap_or(DEFAULT_MASTER_PORT)
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading/writing config file.
    Io(std::io::Error),
    /// Error parsing TOML.
    Parse(toml::de::Error),
    /// Error serializing to TOML.
    Serialize(toml::ser::Error),
    /// Environment variable holds an unparsable value.
    InvalidEnv { var: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialize error: {}", e),
            ConfigError::InvalidEnv { var, value } => {
                write!(f, "Invalid value for {}: {:?}", var, value)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
