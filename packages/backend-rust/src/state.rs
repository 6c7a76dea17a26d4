use std::time::{Instant, SystemTime};

use crate::db::AggregateStore;

#[derive(Clone)]
pub struct AppState {
    store: AggregateStore,
    started_at: Instant,
    started_at_system: SystemTime,
}

impl AppState {
    pub fn new(store: AggregateStore) -> Self {
        Self {
            store,
            started_at: Instant::now(),
            started_at_system: SystemTime::now(),
        }
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    pub fn started_at_system(&self) -> SystemTime {
        self.started_at_system
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
