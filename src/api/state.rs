use std::sync::Arc;

use crate::app::Guardian;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub guardian: Arc<Guardian>,
}

impl AppState {
    pub fn new(guardian: Guardian) -> Self {
        Self {
            guardian: Arc::new(guardian),
        }
    }
}
