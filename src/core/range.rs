/// Half-open (or closed) intervals over an ordered key space
use crate::error::{RoutingError, RoutingResult};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// An immutable interval `[min, max]` with per-bound inclusivity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range<K> {
    min: K,
    max: K,
    is_min_inclusive: bool,
    is_max_inclusive: bool,
}

impl<K: Ord + Clone> Range<K> {
    /// Build a range, failing fast when `min > max`
    pub fn new(min: K, max: K, is_min_inclusive: bool, is_max_inclusive: bool) -> RoutingResult<Self>
    where
        K: fmt::Debug,
    {
        if min > max {
            return Err(RoutingError::invalid_range(format!(
                "min {:?} is greater than max {:?}",
                min, max
            )));
        }

        Ok(Self {
            min,
            max,
            is_min_inclusive,
            is_max_inclusive,
        })
    }

    /// Caller guarantees `min <= max`
    pub(crate) fn new_unchecked(min: K, max: K, is_min_inclusive: bool, is_max_inclusive: bool) -> Self {
        Self {
            min,
            max,
            is_min_inclusive,
            is_max_inclusive,
        }
    }

    /// `[min, max)`, the shape of every partition key range
    pub fn half_open(min: K, max: K) -> RoutingResult<Self>
    where
        K: fmt::Debug,
    {
        Self::new(min, max, true, false)
    }

    /// Single-key range `[key, key]`
    pub fn point(key: K) -> Self {
        Self {
            min: key.clone(),
            max: key,
            is_min_inclusive: true,
            is_max_inclusive: true,
        }
    }

    pub fn min(&self) -> &K {
        &self.min
    }

    pub fn max(&self) -> &K {
        &self.max
    }

    pub fn is_min_inclusive(&self) -> bool {
        self.is_min_inclusive
    }

    pub fn is_max_inclusive(&self) -> bool {
        self.is_max_inclusive
    }

    /// Empty when the bounds coincide and either bound excludes them
    pub fn is_empty(&self) -> bool {
        self.min == self.max && !(self.is_min_inclusive && self.is_max_inclusive)
    }

    pub fn is_single_value(&self) -> bool {
        self.min == self.max && self.is_min_inclusive && self.is_max_inclusive
    }

    pub fn contains(&self, key: &K) -> bool {
        let above_min = match self.min.cmp(key) {
            Ordering::Less => true,
            Ordering::Equal => self.is_min_inclusive,
            Ordering::Greater => false,
        };
        let below_max = match self.max.cmp(key) {
            Ordering::Greater => true,
            Ordering::Equal => self.is_max_inclusive,
            Ordering::Less => false,
        };
        above_min && below_max
    }

    /// Symmetric overlap test; ranges touching at a boundary overlap only if both include it
    pub fn overlaps(&self, other: &Range<K>) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }
        !self.is_before(other) && !other.is_before(self)
    }

    /// True when every key of `self` sorts before every key of `other`
    pub fn is_before(&self, other: &Range<K>) -> bool {
        match self.max.cmp(&other.min) {
            Ordering::Less => true,
            Ordering::Equal => !(self.is_max_inclusive && other.is_min_inclusive),
            Ordering::Greater => false,
        }
    }

    /// Order by lower bound; an inclusive min starts earlier than an exclusive one
    pub fn min_cmp(&self, other: &Range<K>) -> Ordering {
        self.min.cmp(&other.min).then_with(|| {
            match (self.is_min_inclusive, other.is_min_inclusive) {
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                _ => Ordering::Equal,
            }
        })
    }

    /// Order by upper bound; an inclusive max ends later than an exclusive one
    pub fn max_cmp(&self, other: &Range<K>) -> Ordering {
        self.max.cmp(&other.max).then_with(|| {
            match (self.is_max_inclusive, other.is_max_inclusive) {
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                _ => Ordering::Equal,
            }
        })
    }
}

impl<K: fmt::Display> fmt::Display for Range<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:?},{:?}{}",
            if self.is_min_inclusive { '[' } else { '(' },
            self.min.to_string(),
            self.max.to_string(),
            if self.is_max_inclusive { ']' } else { ')' }
        )
    }
}
