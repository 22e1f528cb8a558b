//! Shared handler state.

use chrono::{DateTime, Utc};

use crate::pool::SessionPool;

#[derive(Debug, Clone)]
pub struct AppState {
    pub pool: SessionPool,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(pool: SessionPool) -> Self {
        Self {
            pool,
            started_at: Utc::now(),
        }
    }
}
