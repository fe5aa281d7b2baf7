/// Throughput control group controllers
///
/// A controller gates request issuance for one logical group. Local groups
/// hold a fixed budget; global groups periodically re-read their share of a
/// budget coordinated through a [`BudgetStore`].
use super::bucket::{ThroughputBucket, DEFAULT_CONTROL_INTERVAL};
use super::store::BudgetStore;
use crate::error::{RoutingError, RoutingResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Estimate used before any charge was observed
const INITIAL_ESTIMATE: f64 = 1.0;
/// Weight of the newest charge in the moving average
const ESTIMATE_SMOOTHING: f64 = 0.25;

/// Request-unit budget of a group
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThroughputTarget {
    /// Request units per second
    Absolute(f64),
    /// Fraction of the container's provisioned throughput, in (0, 1]
    Threshold(f64),
}

impl ThroughputTarget {
    pub fn resolve(&self, container_throughput: f64) -> f64 {
        match *self {
            ThroughputTarget::Absolute(ru) => ru,
            ThroughputTarget::Threshold(fraction) => container_throughput * fraction,
        }
    }
}

impl fmt::Display for ThroughputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThroughputTarget::Absolute(ru) => write!(f, "{} RU/s", ru),
            ThroughputTarget::Threshold(fraction) => write!(f, "{:.0}% of container", fraction * 100.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlMode {
    Local,
    Global { renew_interval: Duration },
}

/// Configuration of one throughput control group
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputControlGroup {
    pub name: String,
    pub target: ThroughputTarget,
    pub mode: ControlMode,
    pub is_default: bool,
}

impl ThroughputControlGroup {
    pub fn local<S: Into<String>>(name: S, target: ThroughputTarget) -> Self {
        Self {
            name: name.into(),
            target,
            mode: ControlMode::Local,
            is_default: false,
        }
    }

    pub fn global<S: Into<String>>(name: S, target: ThroughputTarget, renew_interval: Duration) -> Self {
        Self {
            name: name.into(),
            target,
            mode: ControlMode::Global { renew_interval },
            is_default: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Proof of admission; hand it back with the actual charge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub estimate: f64,
}

#[derive(Debug)]
struct CostEstimator {
    average: f64,
    samples: u64,
}

impl CostEstimator {
    fn record(&mut self, charge: f64) {
        self.average = if self.samples == 0 {
            charge
        } else {
            self.average + ESTIMATE_SMOOTHING * (charge - self.average)
        };
        self.samples += 1;
    }
}

/// Token bucket plus cost estimation shared by both controller kinds
#[derive(Debug)]
struct GroupThrottle {
    group_name: String,
    bucket: ThroughputBucket,
    estimator: Mutex<CostEstimator>,
}

impl GroupThrottle {
    fn new(group_name: String, budget: f64) -> Self {
        Self {
            group_name,
            bucket: ThroughputBucket::new(budget, DEFAULT_CONTROL_INTERVAL),
            estimator: Mutex::new(CostEstimator {
                average: INITIAL_ESTIMATE,
                samples: 0,
            }),
        }
    }

    async fn admit(&self, cancel: &CancellationToken) -> RoutingResult<Admission> {
        let estimate = self.estimator.lock().await.average;
        self.bucket.acquire(estimate, cancel).await?;
        log::trace!("Admitted request in group {} (estimate {:.2} RU)", self.group_name, estimate);
        Ok(Admission { estimate })
    }

    async fn record_charge(&self, admission: Admission, actual: f64) {
        self.bucket.reconcile(admission.estimate, actual).await;
        self.estimator.lock().await.record(actual);
    }
}

/// Controller for a group with a fixed, locally held budget
#[derive(Debug)]
pub struct LocalThroughputController {
    throttle: GroupThrottle,
}

impl LocalThroughputController {
    pub fn new<S: Into<String>>(group_name: S, budget: f64) -> Self {
        Self {
            throttle: GroupThrottle::new(group_name.into(), budget),
        }
    }
}

/// Controller whose budget is periodically re-read from a shared store
pub struct GlobalThroughputController {
    throttle: GroupThrottle,
    store: Arc<dyn BudgetStore>,
    renew_interval: Duration,
}

impl fmt::Debug for GlobalThroughputController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalThroughputController")
            .field("throttle", &self.throttle)
            .field("renew_interval", &self.renew_interval)
            .finish()
    }
}

impl GlobalThroughputController {
    pub fn new<S: Into<String>>(
        group_name: S,
        initial_budget: f64,
        store: Arc<dyn BudgetStore>,
        renew_interval: Duration,
    ) -> Self {
        Self {
            throttle: GroupThrottle::new(group_name.into(), initial_budget),
            store,
            renew_interval,
        }
    }

    /// Re-read the shared budget; on failure the last-known budget stays in force
    pub async fn refresh_budget(&self) -> RoutingResult<f64> {
        let group = &self.throttle.group_name;
        match self.store.read_shared_budget(group).await {
            Ok(budget) if budget > 0.0 => {
                self.throttle.bucket.set_capacity(budget).await;
                tracing::debug!("Group {} budget renewed: {:.1} RU/s", group, budget);
                Ok(budget)
            }
            Ok(budget) => {
                tracing::warn!("Ignoring non-positive budget {} for group {}", budget, group);
                Ok(self.throttle.bucket.capacity().await)
            }
            Err(e) => {
                tracing::warn!("Failed to renew budget for group {}: {}, keeping last known", group, e);
                Err(e)
            }
        }
    }

    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }
}

/// Admission controller of one group; the variant is fixed by configuration
#[derive(Debug)]
pub enum ThroughputController {
    Local(LocalThroughputController),
    Global(GlobalThroughputController),
}

impl ThroughputController {
    /// Build the controller a group's configuration asks for
    pub fn for_group(
        group: &ThroughputControlGroup,
        container_throughput: f64,
        budget_store: Option<Arc<dyn BudgetStore>>,
    ) -> RoutingResult<Self> {
        let budget = group.target.resolve(container_throughput);
        if budget.is_nan() || budget <= 0.0 {
            return Err(RoutingError::internal(format!(
                "throughput group {} resolves to a non-positive budget ({})",
                group.name, group.target
            )));
        }

        match group.mode {
            ControlMode::Local => Ok(ThroughputController::Local(LocalThroughputController::new(
                group.name.clone(),
                budget,
            ))),
            ControlMode::Global { renew_interval } => {
                let store = budget_store.ok_or_else(|| {
                    RoutingError::internal(format!(
                        "global throughput group {} requires a budget store",
                        group.name
                    ))
                })?;
                Ok(ThroughputController::Global(GlobalThroughputController::new(
                    group.name.clone(),
                    budget,
                    store,
                    renew_interval,
                )))
            }
        }
    }

    fn throttle(&self) -> &GroupThrottle {
        match self {
            ThroughputController::Local(controller) => &controller.throttle,
            ThroughputController::Global(controller) => &controller.throttle,
        }
    }

    pub fn group_name(&self) -> &str {
        &self.throttle().group_name
    }

    pub fn is_global(&self) -> bool {
        matches!(self, ThroughputController::Global(_))
    }

    /// Wait until the group has budget for one more request
    pub async fn admit(&self, cancel: &CancellationToken) -> RoutingResult<Admission> {
        self.throttle().admit(cancel).await
    }

    /// Report the request's actual cost (zero if it never reached the service)
    pub async fn record_charge(&self, admission: Admission, actual: f64) {
        self.throttle().record_charge(admission, actual).await
    }

    pub async fn estimated_cost(&self) -> f64 {
        self.throttle().estimator.lock().await.average
    }

    pub async fn budget(&self) -> f64 {
        self.throttle().bucket.capacity().await
    }

    pub async fn available(&self) -> f64 {
        self.throttle().bucket.available().await
    }

    /// Start periodic budget renewal for global controllers
    pub fn spawn_budget_refresh(self: &Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let renew_interval = match self.as_ref() {
            ThroughputController::Global(controller) => controller.renew_interval,
            ThroughputController::Local(_) => return None,
        };

        let controller = Arc::clone(self);
        Some(tokio::spawn(async move {
            let ThroughputController::Global(global) = controller.as_ref() else {
                return;
            };
            let mut ticker = tokio::time::interval(renew_interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Budget refresh for group {} stopped", global.throttle.group_name);
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = global.refresh_budget().await;
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throughput::store::StaticBudgetStore;
    use tokio_test::assert_ok;

    #[test]
    fn test_target_resolution() {
        assert_eq!(ThroughputTarget::Absolute(400.0).resolve(10_000.0), 400.0);
        assert_eq!(ThroughputTarget::Threshold(0.25).resolve(1_000.0), 250.0);
        assert_eq!(ThroughputTarget::Threshold(0.5).to_string(), "50% of container");
    }

    #[test]
    fn test_factory_selects_variant() {
        let local = ThroughputController::for_group(
            &ThroughputControlGroup::local("batch", ThroughputTarget::Absolute(100.0)),
            1_000.0,
            None,
        )
        .unwrap();
        assert!(!local.is_global());
        assert_eq!(local.group_name(), "batch");

        let store: Arc<dyn BudgetStore> = Arc::new(StaticBudgetStore::new());
        let global = ThroughputController::for_group(
            &ThroughputControlGroup::global(
                "shared",
                ThroughputTarget::Threshold(0.1),
                Duration::from_secs(5),
            ),
            1_000.0,
            Some(store),
        )
        .unwrap();
        assert!(global.is_global());

        let missing_store = ThroughputController::for_group(
            &ThroughputControlGroup::global("shared", ThroughputTarget::Absolute(10.0), Duration::from_secs(5)),
            1_000.0,
            None,
        );
        assert!(missing_store.is_err());

        let zero = ThroughputController::for_group(
            &ThroughputControlGroup::local("none", ThroughputTarget::Threshold(0.5)),
            0.0,
            None,
        );
        assert!(zero.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_estimate_follows_actual_charges() {
        let controller = ThroughputController::Local(LocalThroughputController::new("g", 100.0));
        let cancel = CancellationToken::new();

        let admission = assert_ok!(controller.admit(&cancel).await);
        assert_eq!(admission.estimate, 1.0);
        controller.record_charge(admission, 10.0).await;
        assert_eq!(controller.estimated_cost().await, 10.0);
        assert_eq!(controller.available().await, 90.0);

        let admission = assert_ok!(controller.admit(&cancel).await);
        assert_eq!(admission.estimate, 10.0);
        controller.record_charge(admission, 2.0).await;
        assert_eq!(controller.estimated_cost().await, 8.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_controller_delays_over_budget() {
        let controller = ThroughputController::Local(LocalThroughputController::new("g", 5.0));
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let admission = assert_ok!(controller.admit(&cancel).await);
            controller.record_charge(admission, 1.0).await;
        }

        let start = tokio::time::Instant::now();
        assert_ok!(controller.admit(&cancel).await);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_admission_respects_budget() {
        let controller = Arc::new(ThroughputController::Local(LocalThroughputController::new("g", 10.0)));
        let start = tokio::time::Instant::now();

        let handles: Vec<_> = (0..35)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    let admission = controller.admit(&cancel).await.unwrap();
                    let admitted_at = start.elapsed();
                    tokio::task::yield_now().await;
                    controller.record_charge(admission, 1.0).await;
                    (admitted_at, admission.estimate)
                })
            })
            .collect();

        let mut per_interval = [0.0f64; 8];
        for handle in handles {
            let (admitted_at, estimate) = handle.await.unwrap();
            per_interval[admitted_at.as_secs() as usize] += estimate;
        }

        assert_eq!(per_interval.iter().sum::<f64>(), 35.0);
        for (interval, cost) in per_interval.iter().enumerate() {
            assert!(*cost <= 10.0, "interval {} admitted {} RU", interval, cost);
        }
        assert_eq!(per_interval[..4], [10.0, 10.0, 10.0, 5.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_refresh_and_fallback() {
        let store = Arc::new(StaticBudgetStore::new());
        store.publish("shared", 50.0);

        let controller = Arc::new(
            ThroughputController::for_group(
                &ThroughputControlGroup::global(
                    "shared",
                    ThroughputTarget::Absolute(200.0),
                    Duration::from_secs(5),
                ),
                1_000.0,
                Some(store.clone() as Arc<dyn BudgetStore>),
            )
            .unwrap(),
        );
        assert_eq!(controller.budget().await, 200.0);

        let cancel = CancellationToken::new();
        let handle = controller.spawn_budget_refresh(cancel.clone()).unwrap();

        // First tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(controller.budget().await, 50.0);

        store.set_unreachable(true);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.budget().await, 50.0);

        store.set_unreachable(false);
        store.publish("shared", 80.0);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.budget().await, 80.0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_controller_has_no_refresh_task() {
        let controller = Arc::new(ThroughputController::Local(LocalThroughputController::new("g", 5.0)));
        assert!(controller.spawn_budget_refresh(CancellationToken::new()).is_none());
    }
}
