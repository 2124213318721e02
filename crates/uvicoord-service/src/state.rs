use std::sync::Arc;

use uvicoord_core::Registry;

use crate::config::ServiceConfig;
use crate::launcher::Launcher;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub launcher: Launcher,
    pub config: Arc<ServiceConfig>,
}
