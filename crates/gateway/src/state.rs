//! Shared handler state.

use std::sync::Arc;

use camofox_browser::Core;

/// Cloned into every handler; everything interesting lives in the core.
#[derive(Clone)]
pub struct AppState {
    pub core: Arc<Core>,
}

impl AppState {
    pub fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub fn production(&self) -> bool {
        self.core.config.production
    }
}
