use dotenvy::dotenv;
use serde::Deserialize;
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Top level of the YAML config file. Every topic below is a namespaced
/// address of the form `BROKER_NAME:TOPIC`.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub debug: bool,
    pub brokers: Vec<BrokerConfig>,
    #[serde(rename = "device")]
    pub device_mgmt: DeviceMgmtConfig,
    pub sdr: SdrConfig,
    pub matrix: MatrixConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    pub name: String,
    pub client: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
    #[serde(rename = "user")]
    pub username: String,
    #[serde(rename = "pass")]
    pub password: String,
    pub manual_acks: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            client: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            tls: false,
            username: String::new(),
            password: String::new(),
            manual_acks: false,
        }
    }
}

/// Raw offsets, random intervals or fixed intervals. See `job_runner`.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct JobRunnerConfig {
    pub offsets: Vec<i32>,
    pub rand_min: i32,
    pub rand_max: i32,
    pub every_start: i32,
    pub every_interval: i32,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct SdrConfig {
    pub topic: String,
    /// Emission interval in minutes.
    pub interval: u64,
    pub allow: Vec<AllowedSensor>,
    #[serde(rename = "rtl_433")]
    pub rtl433: Rtl433Config,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AllowedSensor {
    pub model: String,
    pub id: i64,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct Rtl433Config {
    pub app: String,
    pub protocols: Vec<u32>,
    pub on_seconds: u64,
    pub off_seconds: u64,
    /// Consecutive idle restarts before rebooting. Zero disables the check.
    pub deadman: u32,
    pub reboot_command: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MatrixConfig {
    pub weather: WeatherConfig,
    pub sensors: Vec<TempSensorGroupConfig>,
    pub remote: Vec<RemoteImageConfig>,
    pub local: LocalImagesConfig,
    pub strings: StringsConfig,
    pub mirror: Vec<MirrorConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WeatherConfig {
    pub topic: String,
    pub key: String,
    pub locations: Vec<WeatherLocation>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct WeatherLocation {
    pub zipcode: String,
    pub jobs: JobRunnerConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TempSensorGroupConfig {
    pub topic: String,
    pub jobs: JobRunnerConfig,
    pub sensors: Vec<TempSensorConfig>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TempSensorConfig {
    pub sub: String,
    pub name: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RemoteImageConfig {
    pub topic: String,
    pub height: u32,
    pub width: u32,
    pub sources: Vec<RemoteImageSource>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RemoteImageSource {
    pub uri: String,
    pub offsets: Vec<i32>,
    pub resize_width: u32,
    pub resize_height: u32,
    pub start_x: u32,
    pub start_y: u32,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct LocalImagesConfig {
    pub topic: String,
    pub height: u32,
    pub width: u32,
    pub fixed_delay: i32,
    pub rand_delay: i32,
    pub sources: Vec<PathBuf>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StringsConfig {
    pub topic: String,
    pub jobs: JobRunnerConfig,
    pub strings: Vec<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MirrorConfig {
    pub sub: String,
    #[serde(rename = "pub")]
    pub publish: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DeviceMgmtConfig {
    pub topic: String,
    pub commands: Vec<DeviceCommand>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DeviceCommand {
    pub name: String,
    pub cmdline: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {path} could not be read: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Parsing error: {0}")]
    ParsingError(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Broker names are the routing keys of every namespaced topic, so they
    /// must be unique and must not contain the separator.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for broker in &self.brokers {
            if broker.name.is_empty() {
                return Err(ConfigError::Invalid("broker name must not be empty".to_string()));
            }
            if broker.name.contains(':') {
                return Err(ConfigError::Invalid(format!(
                    "broker name '{}' must not contain ':'",
                    broker.name
                )));
            }
            if broker.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "broker '{}' has no port",
                    broker.name
                )));
            }
            if !seen.insert(broker.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "broker '{}' is configured twice",
                    broker.name
                )));
            }
        }

        Ok(())
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Resolve the config path (first CLI argument, then `HUB_CONFIG`, then
    /// `config.yml`) and load it. `HUB_DEBUG` forces debug logging on.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let path = env::args()
            .nth(1)
            .or_else(|| env::var("HUB_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::from_file(Path::new(&path))?;

        if let Ok(flag) = env::var("HUB_DEBUG") {
            config.debug |= matches!(flag.trim(), "1" | "true" | "yes");
        }

        Ok(config)
    }
}
