use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub capture: FileCaptureConfig,
    #[serde(default)]
    pub logs: FileLogConfig,
    #[serde(default)]
    pub stream: FileStreamConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCaptureConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub script_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_root: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLogConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileStreamConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_heartbeat_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_channel_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_channel_capacity: Option<usize>,
}

/// Environment-derived configuration values. Numeric values stay raw here so
/// the loader can report which variable was malformed.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<String>,
    pub script_path: Option<PathBuf>,
    pub status_file: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub log_capacity: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self::gather_from(|key| std::env::var(key).ok())
    }

    pub fn gather_from<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key).and_then(|value| {
                let trimmed = value.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            })
        };

        Self {
            config_path: non_empty("TIMELAPSE_CONFIG").map(PathBuf::from),
            server_host: non_empty("SERVER_HOST"),
            server_port: non_empty("SERVER_PORT"),
            script_path: non_empty("TIMELAPSE_SCRIPT").map(PathBuf::from),
            status_file: non_empty("TIMELAPSE_STATUS_FILE").map(PathBuf::from),
            output_root: non_empty("TIMELAPSE_OUTPUT_ROOT").map(PathBuf::from),
            log_capacity: non_empty("TIMELAPSE_LOG_CAPACITY"),
        }
    }
}
