/// Throughput control: request-unit admission per logical group
pub mod bucket;
pub mod controller;
pub mod store;

pub use bucket::{ThroughputBucket, DEFAULT_CONTROL_INTERVAL};
pub use controller::{
    Admission, ControlMode, GlobalThroughputController, LocalThroughputController,
    ThroughputControlGroup, ThroughputController, ThroughputTarget,
};
pub use store::{BudgetStore, StaticBudgetStore, ThroughputControlStore};
