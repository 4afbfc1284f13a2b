use crate::criteria::InterceptionCriteria;
use crate::hooks::HookSet;
use arc_swap::ArcSwap;
use std::sync::Arc;

pub mod metrics;

pub use metrics::{ActiveGuard, Metrics, Stat};

/// State shared by every connection the engine serves.
///
/// Criteria and hooks are published as immutable snapshots. A connection
/// loads the snapshot once per decision, so updates apply to later requests
/// without locking the hot path.
pub struct EngineState {
    criteria: ArcSwap<InterceptionCriteria>,
    hooks: ArcSwap<HookSet>,
    pub metrics: Arc<Metrics>,
}

impl EngineState {
    pub fn new(criteria: InterceptionCriteria) -> Self {
        Self {
            criteria: ArcSwap::from_pointee(criteria),
            hooks: ArcSwap::from_pointee(HookSet::new()),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn criteria(&self) -> Arc<InterceptionCriteria> {
        self.criteria.load_full()
    }

    pub fn hooks(&self) -> Arc<HookSet> {
        self.hooks.load_full()
    }

    /// Derive a new criteria snapshot from the current one and publish it.
    pub fn update_criteria<F>(&self, update: F)
    where
        F: Fn(&InterceptionCriteria) -> InterceptionCriteria,
    {
        self.criteria.rcu(|current| update(current));
    }

    pub fn update_hooks<F>(&self, update: F)
    where
        F: Fn(&HookSet) -> HookSet,
    {
        self.hooks.rcu(|current| update(current));
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new(InterceptionCriteria::default())
    }
}
