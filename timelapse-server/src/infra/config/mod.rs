mod loader;
mod models;
mod sources;

pub use loader::{ConfigLoadError, ConfigLoader};
pub use models::{
    CaptureConfig, Config, ConfigMetadata, LogConfig, ServerConfig,
    StreamConfig, DEFAULT_HOST, DEFAULT_PORT,
};
pub use sources::{EnvConfig, FileConfig};
