use std::sync::Arc;

use crate::job::JobEngine;

#[derive(Clone)]
pub(super) struct AppState {
    pub(super) engine: Arc<JobEngine>,
}
