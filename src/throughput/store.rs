/// Group registry and the shared budget store used by global groups
use super::controller::{ThroughputControlGroup, ThroughputController};
use crate::error::{RoutingError, RoutingResult};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Shared store that apportions a global budget among clients
#[async_trait]
pub trait BudgetStore: Send + Sync {
    /// This client's current share of the group's budget, in RU/s
    async fn read_shared_budget(&self, group: &str) -> RoutingResult<f64>;
}

/// In-memory budget store
#[derive(Default)]
pub struct StaticBudgetStore {
    budgets: ArcSwap<FnvHashMap<String, f64>>,
    unreachable: AtomicBool,
}

impl StaticBudgetStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish<S: Into<String>>(&self, group: S, budget: f64) {
        let group = group.into();
        self.budgets.rcu(|current| {
            let mut next = FnvHashMap::clone(current);
            next.insert(group.clone(), budget);
            next
        });
    }

    /// Simulate the store being down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }
}

#[async_trait]
impl BudgetStore for StaticBudgetStore {
    async fn read_shared_budget(&self, group: &str) -> RoutingResult<f64> {
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(RoutingError::metadata("budget store unreachable"));
        }
        self.budgets
            .load()
            .get(group)
            .copied()
            .ok_or_else(|| RoutingError::metadata(format!("no shared budget for group {}", group)))
    }
}

/// All throughput control groups of a client
#[derive(Debug, Default)]
pub struct ThroughputControlStore {
    controllers: FnvHashMap<String, Arc<ThroughputController>>,
    default_group: Option<String>,
}

impl ThroughputControlStore {
    pub fn new(
        groups: &[ThroughputControlGroup],
        container_throughput: f64,
        budget_store: Option<Arc<dyn BudgetStore>>,
    ) -> RoutingResult<Self> {
        let mut store = Self::default();

        for group in groups {
            if store.controllers.contains_key(&group.name) {
                return Err(RoutingError::internal(format!(
                    "duplicate throughput control group {}",
                    group.name
                )));
            }
            if group.is_default {
                if let Some(existing) = &store.default_group {
                    return Err(RoutingError::internal(format!(
                        "groups {} and {} are both marked default",
                        existing, group.name
                    )));
                }
                store.default_group = Some(group.name.clone());
            }

            let controller =
                ThroughputController::for_group(group, container_throughput, budget_store.clone())?;
            log::info!(
                "Throughput control group {} enabled: {} ({})",
                group.name,
                group.target,
                if controller.is_global() { "global" } else { "local" }
            );
            store.controllers.insert(group.name.clone(), Arc::new(controller));
        }

        Ok(store)
    }

    /// Controller for a request: its named group, else the default group
    pub fn controller_for(&self, group: Option<&str>) -> Option<Arc<ThroughputController>> {
        if let Some(name) = group {
            if let Some(controller) = self.controllers.get(name) {
                return Some(controller.clone());
            }
            log::debug!("Unknown throughput control group {}, using default", name);
        }

        self.default_group
            .as_ref()
            .and_then(|name| self.controllers.get(name))
            .cloned()
    }

    pub fn default_group(&self) -> Option<&str> {
        self.default_group.as_deref()
    }

    pub fn group_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.controllers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.controllers.is_empty()
    }

    /// Start budget renewal for every global group
    pub fn spawn_background_tasks(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        self.controllers
            .values()
            .filter_map(|controller| controller.spawn_budget_refresh(cancel.child_token()))
            .collect()
    }
}
