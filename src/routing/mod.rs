/// Partition routing: immutable per-collection maps and the cache that refreshes them
pub mod cache;
pub mod map;

pub use cache::{MetadataSource, PartitionKeyRangeCache, PartitionKeyRangeFeed, StaticMetadataSource};
pub use map::{CollectionRoutingMap, RangeWithOwner};
