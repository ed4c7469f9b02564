use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

use super::{
    models::Config,
    sources::{EnvConfig, FileConfig},
};

#[derive(Debug, Clone, Default)]
struct ConfigLoaderOptions {
    config_path: Option<PathBuf>,
    env_file: Option<PathBuf>,
}

/// Builds a [`Config`] from defaults, an optional TOML file and the
/// environment. Later layers override earlier ones.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    /// Read this file instead of searching for `.env`.
    pub fn with_env_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Load `.env` (if any), read the process environment and compose.
    pub fn load(&self) -> Result<Config, ConfigLoadError> {
        let env_file_loaded = self.load_env_file();
        let env = EnvConfig::gather();
        let mut config = self.load_with_env(env)?;
        config.metadata.env_file_loaded = env_file_loaded;
        Ok(config)
    }

    /// Compose using an explicit environment snapshot.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
    ) -> Result<Config, ConfigLoadError> {
        let config_path = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let file = match &config_path {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let mut config = Config::default();
        apply_file(&mut config, file);
        apply_env(&mut config, &env)?;
        validate(&config)?;

        config.metadata.config_path = config_path;
        Ok(config)
    }

    fn load_env_file(&self) -> bool {
        let result = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| ()),
            None => dotenvy::dotenv().map(|_| ()),
        };
        match result {
            Ok(()) => true,
            Err(err) if err.not_found() => false,
            Err(err) => {
                debug!("ignoring unreadable env file: {err}");
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("configuration file missing: {path}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {field}")]
    InvalidValue { field: &'static str, value: String },
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ConfigLoadError::MissingConfig {
                path: path.to_path_buf(),
            }
        } else {
            ConfigLoadError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;

    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_file(config: &mut Config, file: FileConfig) {
    if let Some(host) = file.server.host {
        config.server.host = host;
    }
    if let Some(port) = file.server.port {
        config.server.port = port;
    }

    if let Some(path) = file.capture.script_path {
        config.capture.script_path = path;
    }
    if let Some(path) = file.capture.status_file {
        config.capture.status_file = path;
    }
    if let Some(path) = file.capture.output_root {
        config.capture.output_root = path;
    }

    if let Some(capacity) = file.logs.capacity {
        config.logs.capacity = capacity;
    }
    if let Some(replay) = file.logs.replay {
        config.logs.replay = replay;
    }

    if let Some(secs) = file.stream.keepalive_secs {
        config.stream.keepalive = Duration::from_secs(secs);
    }
    if let Some(ms) = file.stream.status_heartbeat_ms {
        config.stream.status_heartbeat = Duration::from_millis(ms);
    }
    if let Some(capacity) = file.stream.log_channel_capacity {
        config.stream.log_channel_capacity = capacity;
    }
    if let Some(capacity) = file.stream.status_channel_capacity {
        config.stream.status_channel_capacity = capacity;
    }
}

fn apply_env(config: &mut Config, env: &EnvConfig) -> Result<(), ConfigLoadError> {
    if let Some(host) = &env.server_host {
        config.server.host = host.clone();
    }
    if let Some(port) = &env.server_port {
        config.server.port = parse_field("SERVER_PORT", port)?;
    }
    if let Some(path) = &env.script_path {
        config.capture.script_path = path.clone();
    }
    if let Some(path) = &env.status_file {
        config.capture.status_file = path.clone();
    }
    if let Some(path) = &env.output_root {
        config.capture.output_root = path.clone();
    }
    if let Some(capacity) = &env.log_capacity {
        config.logs.capacity =
            parse_field("TIMELAPSE_LOG_CAPACITY", capacity)?;
    }
    Ok(())
}

fn validate(config: &Config) -> Result<(), ConfigLoadError> {
    let checks: [(&'static str, usize); 3] = [
        ("logs.capacity", config.logs.capacity),
        ("stream.log_channel_capacity", config.stream.log_channel_capacity),
        (
            "stream.status_channel_capacity",
            config.stream.status_channel_capacity,
        ),
    ];
    for (field, value) in checks {
        if value == 0 {
            return Err(ConfigLoadError::InvalidValue {
                field,
                value: value.to_string(),
            });
        }
    }

    if config.stream.keepalive.is_zero() {
        return Err(ConfigLoadError::InvalidValue {
            field: "stream.keepalive_secs",
            value: "0".into(),
        });
    }
    if config.stream.status_heartbeat.is_zero() {
        return Err(ConfigLoadError::InvalidValue {
            field: "stream.status_heartbeat_ms",
            value: "0".into(),
        });
    }
    Ok(())
}

fn parse_field<T: FromStr>(
    field: &'static str,
    raw: &str,
) -> Result<T, ConfigLoadError> {
    raw.parse().map_err(|_| ConfigLoadError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}
