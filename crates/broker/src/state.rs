//! Shared application state for the HTTP layer.

use std::sync::Arc;

use crate::runtime::coordinator::SessionCoordinator;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<SessionCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<SessionCoordinator>) -> Self {
        Self { coordinator }
    }
}
