use std::{fmt, sync::Arc};

use timelapse_core::ProcessSupervisor;

use crate::infra::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: ProcessSupervisor,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let supervisor = ProcessSupervisor::new(config.supervisor_config());
        Self {
            supervisor,
            config: Arc::new(config),
        }
    }
}

impl fmt::Debug for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppState")
            .field("phase", &self.supervisor.phase())
            .finish_non_exhaustive()
    }
}
