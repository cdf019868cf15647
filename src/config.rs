use crate::collectors::SamplingConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const RESERVED_PATHS: [&str; 3] = ["/", "/healthz", "/metrics"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct StatsConfig {
    #[serde(default)]
    pub per_cpu: bool,
    #[serde(default)]
    pub disks: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_update_freq_secs")]
    pub update_freq_secs: f64,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PlatformConfig {
    #[serde(default)]
    pub require_raspberry_pi: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            stats: StatsConfig::default(),
            stream: StreamConfig::default(),
            platform: PlatformConfig::default(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            update_freq_secs: default_update_freq_secs(),
            allowed_origins: Vec::new(),
        }
    }
}

impl StreamConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.update_freq_secs)
            .unwrap_or_else(|_| Duration::from_secs_f64(default_update_freq_secs()))
    }
}

impl StatsConfig {
    pub fn sampling(&self) -> SamplingConfig {
        SamplingConfig {
            per_core: self.per_cpu,
            monitored_paths: self.disks.iter().cloned().collect(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("путь '{0}' не существует или не является каталогом, проверка диска невозможна")]
    MissingDisk(String),
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле listen обязательно".to_string(),
            ));
        }
        if SocketAddr::from_str(&self.listen).is_err() {
            return Err(ConfigError::Validation(
                "поле listen должно быть корректным адресом host:port".to_string(),
            ));
        }

        validate_stream(&self.stream)?;
        validate_disks(&self.stats.disks)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_stream(cfg: &StreamConfig) -> Result<(), ConfigError> {
    if !cfg.update_freq_secs.is_finite() || cfg.update_freq_secs <= 0.0 {
        return Err(ConfigError::Validation(
            "stream.update_freq_secs должно быть положительным числом".to_string(),
        ));
    }
    if Duration::try_from_secs_f64(cfg.update_freq_secs).is_err() {
        return Err(ConfigError::Validation(
            "stream.update_freq_secs слишком велико".to_string(),
        ));
    }
    if !cfg.namespace.starts_with('/') {
        return Err(ConfigError::Validation(
            "stream.namespace должно начинаться с '/'".to_string(),
        ));
    }
    if cfg.namespace.contains(char::is_whitespace) {
        return Err(ConfigError::Validation(
            "stream.namespace не должно содержать пробелов".to_string(),
        ));
    }
    if RESERVED_PATHS.contains(&cfg.namespace.as_str()) {
        return Err(ConfigError::Validation(format!(
            "stream.namespace '{}' занят служебным маршрутом",
            cfg.namespace
        )));
    }
    if cfg.allowed_origins.iter().any(|o| o.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "stream.allowed_origins[*] не должен быть пустым".to_string(),
        ));
    }
    Ok(())
}

fn validate_disks(disks: &[String]) -> Result<(), ConfigError> {
    for disk in disks {
        if !Path::new(disk).is_dir() {
            return Err(ConfigError::MissingDisk(disk.clone()));
        }
    }
    Ok(())
}

fn default_listen() -> String {
    "0.0.0.0:7653".to_string()
}

fn default_namespace() -> String {
    "/stats".to_string()
}

const fn default_update_freq_secs() -> f64 {
    1.0
}
