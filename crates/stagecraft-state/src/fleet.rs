//! Shared read handle over fleet sizes.
//!
//! The capacity controller is the only writer. Everyone else (the health
//! monitor, the API) reads the latest count without touching redb.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use stagecraft_core::Fleet;

use crate::error::StateResult;
use crate::store::StateStore;
use crate::types::{ScalingState, release_key, scaling_key};

/// Latest `ScalingState` per `(pipeline, stage, fleet)`.
#[derive(Debug, Clone, Default)]
pub struct FleetView {
    inner: Arc<RwLock<HashMap<String, ScalingState>>>,
}

impl FleetView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the view from everything persisted in the store.
    pub fn load(store: &StateStore) -> StateResult<Self> {
        let view = Self::new();
        for state in store.list_scaling()? {
            view.record(state);
        }
        Ok(view)
    }

    // Poisoning is ignored: every write is a single insert.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ScalingState>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ScalingState>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the entry for this state's fleet.
    pub fn record(&self, state: ScalingState) {
        self.write().insert(state.table_key(), state);
    }

    pub fn get(&self, pipeline: &str, stage: &str, fleet: Fleet) -> Option<ScalingState> {
        self.read().get(&scaling_key(pipeline, stage, fleet)).cloned()
    }

    /// Current count of one fleet, if it has ever been observed.
    pub fn count(&self, pipeline: &str, stage: &str, fleet: Fleet) -> Option<u32> {
        self.get(pipeline, stage, fleet).map(|s| s.current_count)
    }

    /// `(compute, task)` counts for a stage.
    pub fn sizes(&self, pipeline: &str, stage: &str) -> (Option<u32>, Option<u32>) {
        (
            self.count(pipeline, stage, Fleet::Compute),
            self.count(pipeline, stage, Fleet::Task),
        )
    }

    /// All entries for one stage.
    pub fn stage(&self, pipeline: &str, stage: &str) -> Vec<ScalingState> {
        let prefix = format!("{}:", release_key(pipeline, stage));
        self.read()
            .iter()
            .filter(|(k, v)| k.starts_with(&prefix) && v.stage == stage)
            .map(|(_, v)| v.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_read_sizes() {
        let view = FleetView::new();
        assert_eq!(view.sizes("svc", "dev"), (None, None));

        view.record(ScalingState::new("svc", "dev", Fleet::Compute, 2));
        view.record(ScalingState::new("svc", "dev", Fleet::Task, 3));
        view.record(ScalingState::new("svc", "prod", Fleet::Task, 9));

        assert_eq!(view.sizes("svc", "dev"), (Some(2), Some(3)));
        assert_eq!(view.stage("svc", "dev").len(), 2);
    }

    #[test]
    fn clones_share_entries() {
        let view = FleetView::new();
        let reader = view.clone();
        view.record(ScalingState::new("svc", "dev", Fleet::Task, 1));
        view.record(ScalingState::new("svc", "dev", Fleet::Task, 2));
        assert_eq!(reader.count("svc", "dev", Fleet::Task), Some(2));
    }

    #[test]
    fn survives_a_poisoned_lock() {
        let view = FleetView::new();
        view.record(ScalingState::new("svc", "dev", Fleet::Task, 1));

        let poisoner = view.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("writer died");
        })
        .join();
        assert!(view.inner.is_poisoned());

        view.record(ScalingState::new("svc", "dev", Fleet::Task, 2));
        assert_eq!(view.count("svc", "dev", Fleet::Task), Some(2));
        assert_eq!(view.stage("svc", "dev").len(), 1);
    }

    #[test]
    fn load_from_store() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_scaling(&ScalingState::new("svc", "dev", Fleet::Compute, 4)).unwrap();

        let view = FleetView::load(&store).unwrap();
        assert_eq!(view.count("svc", "dev", Fleet::Compute), Some(4));
    }
}
