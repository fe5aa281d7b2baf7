/// Partition key range cache
///
/// Holds one copy-on-write routing snapshot per collection. Readers load the
/// current `Arc<CollectionRoutingMap>` without locking; refreshes build a new
/// snapshot and swap it in only after it validated.
use super::map::{CollectionRoutingMap, RangeWithOwner};
use crate::error::{RoutingError, RoutingResult};
use arc_swap::{ArcSwap, ArcSwapOption};
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Partition key ranges returned by a metadata fetch
#[derive(Debug, Clone, Default)]
pub struct PartitionKeyRangeFeed {
    pub ranges: Vec<RangeWithOwner>,
    /// Opaque continuation for the next incremental fetch
    pub continuation: Option<String>,
}

/// Source of truth for partition layouts
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// Fetch the ranges of a collection.
    ///
    /// With `if_none_match == None` the full layout is returned. Otherwise only
    /// ranges changed since that continuation are returned (possibly none).
    async fn fetch_partition_key_ranges(
        &self,
        collection: &str,
        if_none_match: Option<&str>,
    ) -> RoutingResult<PartitionKeyRangeFeed>;
}

#[derive(Default)]
struct CollectionEntry {
    map: ArcSwapOption<CollectionRoutingMap>,
    refresh_lock: Mutex<()>,
}

/// Per-collection routing snapshots backed by a [`MetadataSource`]
pub struct PartitionKeyRangeCache {
    source: Arc<dyn MetadataSource>,
    entries: ArcSwap<FnvHashMap<String, Arc<CollectionEntry>>>,
}

impl PartitionKeyRangeCache {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            entries: ArcSwap::from_pointee(FnvHashMap::default()),
        }
    }

    fn entry(&self, collection: &str) -> Arc<CollectionEntry> {
        if let Some(entry) = self.entries.load().get(collection) {
            return entry.clone();
        }

        let candidate = Arc::new(CollectionEntry::default());
        self.entries.rcu(|current| {
            let mut next = FnvHashMap::clone(current);
            next.entry(collection.to_string())
                .or_insert_with(|| candidate.clone());
            next
        });

        self.entries
            .load()
            .get(collection)
            .cloned()
            .unwrap_or(candidate)
    }

    /// Current snapshot without touching the source
    pub fn get_cached(&self, collection: &str) -> Option<Arc<CollectionRoutingMap>> {
        self.entries
            .load()
            .get(collection)
            .and_then(|entry| entry.map.load_full())
    }

    /// Collections with a loaded snapshot
    pub fn cached_collections(&self) -> Vec<String> {
        self.entries
            .load()
            .iter()
            .filter(|(_, entry)| entry.map.load().is_some())
            .map(|(collection, _)| collection.clone())
            .collect()
    }

    /// Current snapshot, fetched from the source on first use
    pub async fn try_lookup(&self, collection: &str) -> RoutingResult<Arc<CollectionRoutingMap>> {
        let entry = self.entry(collection);
        if let Some(map) = entry.map.load_full() {
            return Ok(map);
        }

        let _guard = entry.refresh_lock.lock().await;
        if let Some(map) = entry.map.load_full() {
            return Ok(map);
        }

        let map = Arc::new(self.fetch_full(collection).await?);
        entry.map.store(Some(map.clone()));
        log::info!(
            "Loaded routing map for {} with {} partition key ranges",
            collection,
            map.len()
        );
        Ok(map)
    }

    /// Replace the snapshot `previous` with a fresher one
    ///
    /// If another task already replaced `previous`, that newer snapshot is
    /// returned without fetching again. Pass `None` to force a refresh.
    pub async fn refresh(
        &self,
        collection: &str,
        previous: Option<&Arc<CollectionRoutingMap>>,
    ) -> RoutingResult<Arc<CollectionRoutingMap>> {
        let entry = self.entry(collection);
        let _guard = entry.refresh_lock.lock().await;

        let current = entry.map.load_full();
        if let (Some(current), Some(previous)) = (&current, previous) {
            if !Arc::ptr_eq(current, previous) {
                log::debug!("Routing map for {} already refreshed", collection);
                return Ok(current.clone());
            }
        }

        let next = match current {
            Some(current) => self.fetch_incremental(collection, &current).await?,
            None => self.fetch_full(collection).await?,
        };

        let next = Arc::new(next);
        entry.map.store(Some(next.clone()));
        Ok(next)
    }

    /// Drop the snapshot; the next lookup fetches a full layout
    pub fn invalidate(&self, collection: &str) {
        if let Some(entry) = self.entries.load().get(collection) {
            entry.map.store(None);
            log::debug!("Invalidated routing map for {}", collection);
        }
    }

    async fn fetch_full(&self, collection: &str) -> RoutingResult<CollectionRoutingMap> {
        let feed = self
            .source
            .fetch_partition_key_ranges(collection, None)
            .await?;
        CollectionRoutingMap::try_create(collection, feed.ranges, feed.continuation)
    }

    async fn fetch_incremental(
        &self,
        collection: &str,
        current: &CollectionRoutingMap,
    ) -> RoutingResult<CollectionRoutingMap> {
        let continuation = current.change_feed_next_if_none_match();
        let feed = self
            .source
            .fetch_partition_key_ranges(collection, continuation)
            .await?;

        match current.try_combine(feed.ranges, feed.continuation) {
            Ok(map) => Ok(map),
            Err(RoutingError::NonContiguousUpdate { message, .. }) => {
                log::warn!(
                    "Incremental update for {} rejected ({}), fetching full layout",
                    collection,
                    message
                );
                self.fetch_full(collection).await
            }
            Err(e) => Err(e),
        }
    }

    /// Periodically refresh every loaded collection until `cancel` fires
    pub fn spawn_background_refresh(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Routing map refresh loop stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        for collection in self.cached_collections() {
                            let previous = self.get_cached(&collection);
                            match self.refresh(&collection, previous.as_ref()).await {
                                Ok(map) => {
                                    tracing::debug!(
                                        "Refreshed routing map for {}: {} ranges",
                                        collection,
                                        map.len()
                                    );
                                }
                                Err(e) => {
                                    tracing::warn!(
                                        "Failed to refresh routing map for {}: {}",
                                        collection,
                                        e
                                    );
                                }
                            }
                        }
                    }
                }
            }
        })
    }
}

struct StaticLayout {
    generation: u64,
    ranges: Vec<RangeWithOwner>,
}

/// In-memory metadata source with publishable layouts
///
/// Continuations are layout generations. An incremental fetch at the current
/// generation returns no ranges; a stale one returns the full current layout.
#[derive(Default)]
pub struct StaticMetadataSource {
    layouts: RwLock<FnvHashMap<String, StaticLayout>>,
    fetches: AtomicUsize,
}

impl StaticMetadataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_collection<S: Into<String>>(
        mut self,
        collection: S,
        ranges: Vec<RangeWithOwner>,
    ) -> Self {
        self.layouts
            .get_mut()
            .insert(collection.into(), StaticLayout { generation: 1, ranges });
        self
    }

    /// Replace the layout of a collection, bumping its generation
    pub async fn publish<S: Into<String>>(&self, collection: S, ranges: Vec<RangeWithOwner>) {
        let mut layouts = self.layouts.write().await;
        let layout = layouts
            .entry(collection.into())
            .or_insert_with(|| StaticLayout {
                generation: 0,
                ranges: Vec::new(),
            });
        layout.generation += 1;
        layout.ranges = ranges;
    }

    /// Number of fetches served, for observing refresh behaviour
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataSource for StaticMetadataSource {
    async fn fetch_partition_key_ranges(
        &self,
        collection: &str,
        if_none_match: Option<&str>,
    ) -> RoutingResult<PartitionKeyRangeFeed> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let layouts = self.layouts.read().await;
        let layout = layouts
            .get(collection)
            .ok_or_else(|| RoutingError::CollectionNotFound {
                collection: collection.to_string(),
            })?;

        let generation = layout.generation.to_string();
        let ranges = if if_none_match == Some(generation.as_str()) {
            Vec::new()
        } else {
            layout.ranges.clone()
        };

        Ok(PartitionKeyRangeFeed {
            ranges,
            continuation: Some(generation),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PartitionKeyRange, ServerIdentity};

    fn entry(id: &str, min: &str, max: &str) -> RangeWithOwner {
        (
            PartitionKeyRange::new(id, min, max).unwrap(),
            ServerIdentity::new(format!("rs-{}", id)),
        )
    }

    fn child(id: &str, min: &str, max: &str, parent: &str) -> RangeWithOwner {
        let (range, owner) = entry(id, min, max);
        (range.with_parents([parent]), owner)
    }

    fn source() -> Arc<StaticMetadataSource> {
        Arc::new(
            StaticMetadataSource::new()
                .with_collection("orders", vec![entry("A", "", "80"), entry("B", "80", "FF")]),
        )
    }

    #[tokio::test]
    async fn test_lookup_fetches_once() {
        let source = source();
        let cache = PartitionKeyRangeCache::new(source.clone());

        let first = cache.try_lookup("orders").await.unwrap();
        let second = cache.try_lookup("orders").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetch_count(), 1);
        assert_eq!(cache.cached_collections(), vec!["orders".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_collection() {
        let cache = PartitionKeyRangeCache::new(source());
        let result = cache.try_lookup("missing").await;
        assert!(matches!(result, Err(RoutingError::CollectionNotFound { .. })));
        assert!(cache.get_cached("missing").is_none());
    }

    #[tokio::test]
    async fn test_refresh_picks_up_split() {
        let source = source();
        let cache = PartitionKeyRangeCache::new(source.clone());
        let before = cache.try_lookup("orders").await.unwrap();

        source
            .publish(
                "orders",
                vec![
                    child("C", "", "40", "A"),
                    child("D", "40", "80", "A"),
                    entry("B", "80", "FF"),
                ],
            )
            .await;

        let after = cache.refresh("orders", Some(&before)).await.unwrap();
        let ids: Vec<_> = after
            .ordered_partition_key_ranges()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["C", "D", "B"]);
        assert!(after.is_gone("A"));

        // Old snapshot is still intact for readers that hold it
        assert_eq!(before.len(), 2);
        assert!(Arc::ptr_eq(&cache.get_cached("orders").unwrap(), &after));
    }

    #[tokio::test]
    async fn test_refresh_is_coalesced() {
        let source = source();
        let cache = PartitionKeyRangeCache::new(source.clone());
        let stale = cache.try_lookup("orders").await.unwrap();

        let first = cache.refresh("orders", Some(&stale)).await.unwrap();
        let fetches = source.fetch_count();

        // Second caller still holds the stale snapshot; no new fetch happens
        let second = cache.refresh("orders", Some(&stale)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.fetch_count(), fetches);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refreshes_fetch_once() {
        let source = source();
        let cache = Arc::new(PartitionKeyRangeCache::new(source.clone()));
        let stale = cache.try_lookup("orders").await.unwrap();
        let fetches = source.fetch_count();

        let refreshes = (0..8).map(|_| {
            let cache = cache.clone();
            let stale = stale.clone();
            async move { cache.refresh("orders", Some(&stale)).await }
        });
        let results = futures::future::join_all(refreshes).await;

        assert_eq!(source.fetch_count(), fetches + 1);
        let current = cache.get_cached("orders").unwrap();
        assert!(!Arc::ptr_eq(&current, &stale));
        for result in results {
            assert!(Arc::ptr_eq(&result.unwrap(), &current));
        }
    }

    #[tokio::test]
    async fn test_refresh_without_changes_keeps_layout() {
        let source = source();
        let cache = PartitionKeyRangeCache::new(source.clone());
        let before = cache.try_lookup("orders").await.unwrap();

        let after = cache.refresh("orders", None).await.unwrap();
        assert_eq!(
            after.ordered_partition_key_ranges(),
            before.ordered_partition_key_ranges()
        );
        assert_eq!(after.change_feed_next_if_none_match(), Some("1"));
    }

    struct SplittingSource {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl MetadataSource for SplittingSource {
        async fn fetch_partition_key_ranges(
            &self,
            _collection: &str,
            if_none_match: Option<&str>,
        ) -> RoutingResult<PartitionKeyRangeFeed> {
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let ranges = match if_none_match {
                None if self.fetches.load(Ordering::Relaxed) == 1 => {
                    vec![entry("A", "", "80"), entry("B", "80", "FF")]
                }
                None => vec![entry("C", "", "40"), entry("D", "40", "FF")],
                // Incremental feed that leaves a gap
                Some(_) => vec![entry("C", "", "40")],
            };
            Ok(PartitionKeyRangeFeed {
                ranges,
                continuation: Some("next".to_string()),
            })
        }
    }

    #[tokio::test]
    async fn test_non_contiguous_update_falls_back_to_full_fetch() {
        let source = Arc::new(SplittingSource {
            fetches: AtomicUsize::new(0),
        });
        let cache = PartitionKeyRangeCache::new(source.clone());
        cache.try_lookup("orders").await.unwrap();

        let refreshed = cache.refresh("orders", None).await.unwrap();
        let ids: Vec<_> = refreshed
            .ordered_partition_key_ranges()
            .iter()
            .map(|r| r.id.as_str())
            .collect();
        assert_eq!(ids, vec!["C", "D"]);
        assert_eq!(source.fetches.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_invalidate_forces_full_fetch() {
        let source = source();
        let cache = PartitionKeyRangeCache::new(source.clone());
        cache.try_lookup("orders").await.unwrap();

        cache.invalidate("orders");
        assert!(cache.get_cached("orders").is_none());
        cache.try_lookup("orders").await.unwrap();
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_refresh_stops_on_cancel() {
        let source = source();
        let cache = Arc::new(PartitionKeyRangeCache::new(source.clone()));
        cache.try_lookup("orders").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = cache
            .clone()
            .spawn_background_refresh(Duration::from_secs(10), cancel.clone());

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert!(source.fetch_count() >= 2);

        cancel.cancel();
        handle.await.unwrap();
    }
}
