/// Core abstractions shared by routing, retry and throughput control
pub mod partition;
pub mod range;
pub mod session;

pub use partition::{
    KeySpace, PartitionKey, PartitionKeyRange, PartitionKeyValue, ServerIdentity,
    MAXIMUM_EXCLUSIVE_EFFECTIVE_PARTITION_KEY, MINIMUM_INCLUSIVE_EFFECTIVE_PARTITION_KEY,
};
pub use range::Range;
pub use session::{SessionContainer, SessionToken};
