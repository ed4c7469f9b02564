use std::{path::PathBuf, time::Duration};

use timelapse_core::{
    HubConfig, SupervisorConfig,
    broadcast::{DEFAULT_LOG_CHANNEL_CAPACITY, DEFAULT_STATUS_CHANNEL_CAPACITY},
    logs::DEFAULT_LOG_CAPACITY,
    supervisor::{DEFAULT_SCRIPT_PATH, DEFAULT_STATUS_FILE},
};

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_LOG_REPLAY: usize = 50;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;
pub const DEFAULT_STATUS_HEARTBEAT_MS: u64 = 750;

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub capture: CaptureConfig,
    pub logs: LogConfig,
    pub stream: StreamConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Script invoked as `<script> <interval> <frames>`.
    pub script_path: PathBuf,
    pub status_file: PathBuf,
    /// Directory the script creates its `timelapse_*` run folders in.
    pub output_root: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub capacity: usize,
    /// Lines replayed to a log stream when it connects.
    pub replay: usize,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub keepalive: Duration,
    pub status_heartbeat: Duration,
    pub log_channel_capacity: usize,
    pub status_channel_capacity: usize,
}

/// Where the configuration came from, for startup logging.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
            },
            capture: CaptureConfig {
                script_path: PathBuf::from(DEFAULT_SCRIPT_PATH),
                status_file: PathBuf::from(DEFAULT_STATUS_FILE),
                output_root: PathBuf::from("."),
            },
            logs: LogConfig {
                capacity: DEFAULT_LOG_CAPACITY,
                replay: DEFAULT_LOG_REPLAY,
            },
            stream: StreamConfig {
                keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
                status_heartbeat: Duration::from_millis(
                    DEFAULT_STATUS_HEARTBEAT_MS,
                ),
                log_channel_capacity: DEFAULT_LOG_CHANNEL_CAPACITY,
                status_channel_capacity: DEFAULT_STATUS_CHANNEL_CAPACITY,
            },
            metadata: ConfigMetadata::default(),
        }
    }
}

impl Config {
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            script_path: self.capture.script_path.clone(),
            status_file: self.capture.status_file.clone(),
            log_capacity: self.logs.capacity,
            hub: HubConfig {
                log_capacity: self.stream.log_channel_capacity,
                status_capacity: self.stream.status_channel_capacity,
            },
        }
    }
}
