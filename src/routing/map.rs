/// Immutable routing snapshot of one collection
///
/// A `CollectionRoutingMap` is never mutated after construction. Topology
/// changes produce a new snapshot through [`CollectionRoutingMap::try_combine`],
/// which is only accepted when the ranges still tile the key space.
use crate::core::{KeySpace, PartitionKeyRange, Range, ServerIdentity};
use crate::error::{RoutingError, RoutingResult};
use fnv::{FnvHashMap, FnvHashSet};
use std::collections::BTreeSet;

/// A partition key range together with the replica set that owns it
pub type RangeWithOwner = (PartitionKeyRange, ServerIdentity);

#[derive(Debug, Clone)]
pub struct CollectionRoutingMap {
    collection_unique_id: String,
    key_space: KeySpace,
    /// Sorted by `range.min`
    ordered_ranges: Vec<PartitionKeyRange>,
    /// Owner of `ordered_ranges[i]`
    owners: Vec<ServerIdentity>,
    range_by_id: FnvHashMap<String, usize>,
    gone_ranges: FnvHashSet<String>,
    change_feed_next_if_none_match: Option<String>,
}

impl CollectionRoutingMap {
    /// Build a complete map over the effective partition key space
    pub fn try_create<S: Into<String>>(
        collection_unique_id: S,
        ranges: Vec<RangeWithOwner>,
        change_feed_next_if_none_match: Option<String>,
    ) -> RoutingResult<Self> {
        Self::try_create_in(
            KeySpace::default(),
            collection_unique_id,
            ranges,
            change_feed_next_if_none_match,
        )
    }

    /// Build a complete map over a custom key space
    ///
    /// Ranges listed as the parent of another supplied range are dropped, so a
    /// full change feed (which still carries pre-split ranges) can be passed as is.
    pub fn try_create_in<S: Into<String>>(
        key_space: KeySpace,
        collection_unique_id: S,
        ranges: Vec<RangeWithOwner>,
        change_feed_next_if_none_match: Option<String>,
    ) -> RoutingResult<Self> {
        let collection_unique_id = collection_unique_id.into();

        let gone_ranges: FnvHashSet<String> = ranges
            .iter()
            .flat_map(|(range, _)| range.parents.iter().cloned())
            .collect();

        let mut by_id: FnvHashMap<String, RangeWithOwner> = FnvHashMap::default();
        for (range, owner) in ranges {
            if gone_ranges.contains(&range.id) {
                continue;
            }
            if let Some((existing, _)) = by_id.get(&range.id) {
                if existing.range != range.range {
                    return Err(RoutingError::non_contiguous(
                        collection_unique_id,
                        format!("partition key range id {} is reported twice", range.id),
                    ));
                }
            }
            by_id.insert(range.id.clone(), (range, owner));
        }

        Self::build(
            key_space,
            collection_unique_id,
            by_id,
            gone_ranges,
            change_feed_next_if_none_match,
        )
    }

    fn build(
        key_space: KeySpace,
        collection_unique_id: String,
        by_id: FnvHashMap<String, RangeWithOwner>,
        gone_ranges: FnvHashSet<String>,
        change_feed_next_if_none_match: Option<String>,
    ) -> RoutingResult<Self> {
        let mut entries: Vec<RangeWithOwner> = by_id.into_values().collect();
        entries.sort_by(|(a, _), (b, _)| a.range.min_cmp(&b.range));

        Self::validate_complete(&key_space, &collection_unique_id, &entries)?;

        let mut ordered_ranges = Vec::with_capacity(entries.len());
        let mut owners = Vec::with_capacity(entries.len());
        let mut range_by_id = FnvHashMap::default();
        for (index, (range, owner)) in entries.into_iter().enumerate() {
            range_by_id.insert(range.id.clone(), index);
            ordered_ranges.push(range);
            owners.push(owner);
        }

        Ok(Self {
            collection_unique_id,
            key_space,
            ordered_ranges,
            owners,
            range_by_id,
            gone_ranges,
            change_feed_next_if_none_match,
        })
    }

    /// Sorted ranges must start at the key-space minimum, end at its maximum,
    /// and each range must end exactly where the next one starts.
    fn validate_complete(
        key_space: &KeySpace,
        collection: &str,
        entries: &[RangeWithOwner],
    ) -> RoutingResult<()> {
        let (first, last) = match (entries.first(), entries.last()) {
            (Some((first, _)), Some((last, _))) => (first, last),
            _ => {
                return Err(RoutingError::non_contiguous(
                    collection,
                    "no partition key ranges",
                ))
            }
        };

        for (range, _) in entries {
            if !range.range.is_min_inclusive() || range.range.is_max_inclusive() {
                return Err(RoutingError::non_contiguous(
                    collection,
                    format!("range {} is not [min, max)", range),
                ));
            }
            if range.range.is_empty() {
                return Err(RoutingError::non_contiguous(
                    collection,
                    format!("range {} is empty", range),
                ));
            }
        }

        if first.min_inclusive() != key_space.min() {
            return Err(RoutingError::non_contiguous(
                collection,
                format!(
                    "first range starts at {:?}, expected {:?}",
                    first.min_inclusive(),
                    key_space.min()
                ),
            ));
        }

        if last.max_exclusive() != key_space.max() {
            return Err(RoutingError::non_contiguous(
                collection,
                format!(
                    "last range ends at {:?}, expected {:?}",
                    last.max_exclusive(),
                    key_space.max()
                ),
            ));
        }

        for pair in entries.windows(2) {
            let (left, right) = (&pair[0].0, &pair[1].0);
            if left.max_exclusive() != right.min_inclusive() {
                let problem = if left.max_exclusive() < right.min_inclusive() {
                    "gap"
                } else {
                    "overlap"
                };
                return Err(RoutingError::non_contiguous(
                    collection,
                    format!("{} between {} and {}", problem, left, right),
                ));
            }
        }

        Ok(())
    }

    pub fn collection_unique_id(&self) -> &str {
        &self.collection_unique_id
    }

    pub fn key_space(&self) -> &KeySpace {
        &self.key_space
    }

    pub fn change_feed_next_if_none_match(&self) -> Option<&str> {
        self.change_feed_next_if_none_match.as_deref()
    }

    pub fn len(&self) -> usize {
        self.ordered_ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered_ranges.is_empty()
    }

    /// All ranges, sorted by their lower bound
    pub fn ordered_partition_key_ranges(&self) -> &[PartitionKeyRange] {
        &self.ordered_ranges
    }

    /// The unique range containing `key`
    pub fn range_by_effective_partition_key(&self, key: &str) -> RoutingResult<&PartitionKeyRange> {
        if !self.key_space.contains(key) {
            return Err(RoutingError::InvalidEffectivePartitionKey {
                key: key.to_string(),
            });
        }

        let index = self
            .ordered_ranges
            .partition_point(|range| range.min_inclusive() <= key);

        match index.checked_sub(1).map(|i| &self.ordered_ranges[i]) {
            Some(range) if range.range.contains(&key.to_string()) => Ok(range),
            _ => {
                log::error!(
                    "No partition key range owns {:?} in collection {}",
                    key,
                    self.collection_unique_id
                );
                Err(RoutingError::inconsistent(
                    self.collection_unique_id.clone(),
                    format!("no range contains effective partition key {:?}", key),
                ))
            }
        }
    }

    pub fn range_by_partition_key_range_id(&self, id: &str) -> RoutingResult<&PartitionKeyRange> {
        self.try_range_by_partition_key_range_id(id)
            .ok_or_else(|| RoutingError::PartitionKeyRangeNotFound {
                collection: self.collection_unique_id.clone(),
                id: id.to_string(),
            })
    }

    pub fn try_range_by_partition_key_range_id(&self, id: &str) -> Option<&PartitionKeyRange> {
        self.range_by_id.get(id).map(|&index| &self.ordered_ranges[index])
    }

    /// Owner of a range, if the id is part of this snapshot
    pub fn owner_of(&self, id: &str) -> Option<&ServerIdentity> {
        self.range_by_id.get(id).map(|&index| &self.owners[index])
    }

    /// Every range intersecting `query`, in key order
    pub fn overlapping_ranges(&self, query: &Range<String>) -> Vec<&PartitionKeyRange> {
        self.overlapping_ranges_for(std::slice::from_ref(query))
    }

    /// Every range intersecting any of `queries`, in key order, each reported once
    pub fn overlapping_ranges_for(&self, queries: &[Range<String>]) -> Vec<&PartitionKeyRange> {
        let mut hits = BTreeSet::new();

        for query in queries {
            if query.is_empty() {
                continue;
            }
            let start = self
                .ordered_ranges
                .partition_point(|range| range.range.is_before(query));

            for (index, range) in self.ordered_ranges.iter().enumerate().skip(start) {
                if !range.range.overlaps(query) {
                    break;
                }
                hits.insert(index);
            }
        }

        hits.into_iter()
            .map(|index| &self.ordered_ranges[index])
            .collect()
    }

    /// True once the id was split or merged away
    pub fn is_gone(&self, id: &str) -> bool {
        self.gone_ranges.contains(id)
    }

    pub fn gone_ranges(&self) -> impl Iterator<Item = &str> {
        self.gone_ranges.iter().map(String::as_str)
    }

    /// Splice updated ranges into a new snapshot
    ///
    /// Existing ranges named as parents of an incoming range, or overlapping one,
    /// are superseded. The result must still tile the key space; otherwise
    /// `NonContiguousUpdate` is returned and callers should rebuild the map from
    /// a full fetch instead of retrying the combination.
    pub fn try_combine(
        &self,
        ranges: Vec<RangeWithOwner>,
        change_feed_next_if_none_match: Option<String>,
    ) -> RoutingResult<Self> {
        let mut gone_ranges = self.gone_ranges.clone();
        gone_ranges.extend(
            ranges
                .iter()
                .flat_map(|(range, _)| range.parents.iter().cloned()),
        );

        // Stale reports must not supersede the live ranges they overlap
        let ranges: Vec<RangeWithOwner> = ranges
            .into_iter()
            .filter(|(range, _)| {
                let stale = gone_ranges.contains(&range.id);
                if stale {
                    log::debug!(
                        "Ignoring partition key range {} of {}: already gone",
                        range.id,
                        self.collection_unique_id
                    );
                }
                !stale
            })
            .collect();

        let incoming_ids: FnvHashSet<&str> =
            ranges.iter().map(|(range, _)| range.id.as_str()).collect();
        for existing in &self.ordered_ranges {
            if incoming_ids.contains(existing.id.as_str()) {
                continue;
            }
            let superseded = ranges
                .iter()
                .any(|(incoming, _)| incoming.range.overlaps(&existing.range));
            if superseded {
                gone_ranges.insert(existing.id.clone());
            }
        }

        let mut by_id: FnvHashMap<String, RangeWithOwner> = self
            .ordered_ranges
            .iter()
            .zip(self.owners.iter())
            .filter(|(range, _)| !gone_ranges.contains(&range.id))
            .map(|(range, owner)| (range.id.clone(), (range.clone(), owner.clone())))
            .collect();

        for (range, owner) in ranges {
            by_id.insert(range.id.clone(), (range, owner));
        }

        Self::build(
            self.key_space.clone(),
            self.collection_unique_id.clone(),
            by_id,
            gone_ranges,
            change_feed_next_if_none_match.or_else(|| self.change_feed_next_if_none_match.clone()),
        )
    }
}
