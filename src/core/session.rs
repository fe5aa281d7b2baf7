/// Session tokens for read-your-writes consistency
use super::partition::PartitionKeyRange;
use crate::error::{RoutingError, RoutingResult};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Progress marker of one partition: `<version>#<global lsn>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionToken {
    pub version: u64,
    pub global_lsn: u64,
}

impl SessionToken {
    pub fn new(version: u64, global_lsn: u64) -> Self {
        Self {
            version,
            global_lsn,
        }
    }

    /// Keep whichever token has seen more: higher version first, then higher LSN
    pub fn merge(self, other: SessionToken) -> SessionToken {
        match self.version.cmp(&other.version) {
            std::cmp::Ordering::Less => other,
            std::cmp::Ordering::Greater => self,
            std::cmp::Ordering::Equal => {
                if other.global_lsn > self.global_lsn {
                    other
                } else {
                    self
                }
            }
        }
    }

    pub fn is_as_recent_as(&self, other: &SessionToken) -> bool {
        self.merge(*other) == *self
    }
}

impl FromStr for SessionToken {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (version, lsn) = s
            .split_once('#')
            .ok_or_else(|| RoutingError::internal(format!("Malformed session token: {}", s)))?;

        let version = version
            .parse::<u64>()
            .map_err(|_| RoutingError::internal(format!("Malformed session version: {}", s)))?;
        // Regional progress vectors may trail the global LSN; only the global LSN is ordered here
        let lsn = lsn.split('#').next().unwrap_or(lsn);
        let global_lsn = lsn
            .parse::<u64>()
            .map_err(|_| RoutingError::internal(format!("Malformed session lsn: {}", s)))?;

        Ok(Self::new(version, global_lsn))
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.version, self.global_lsn)
    }
}

/// Split a compound `<rangeId>:<token>[,<rangeId>:<token>...]` header value
pub fn parse_compound_session_token(value: &str) -> RoutingResult<Vec<(String, SessionToken)>> {
    value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .map(|part| {
            let (range_id, token) = part.trim().split_once(':').ok_or_else(|| {
                RoutingError::internal(format!("Session token without range id: {}", part))
            })?;
            Ok((range_id.to_string(), token.parse::<SessionToken>()?))
        })
        .collect()
}

/// Session tokens per collection and partition key range
pub struct SessionContainer {
    tokens: Arc<RwLock<HashMap<String, HashMap<String, SessionToken>>>>,
}

impl SessionContainer {
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Merge a token observed in a response; tokens never move backwards
    pub async fn record(&self, collection: &str, range_id: &str, token: SessionToken) {
        let mut tokens = self.tokens.write().await;
        let ranges = tokens.entry(collection.to_string()).or_default();

        match ranges.get_mut(range_id) {
            Some(existing) => {
                *existing = existing.merge(token);
            }
            None => {
                ranges.insert(range_id.to_string(), token);
            }
        }
    }

    /// Merge every entry of a compound session header
    pub async fn record_compound(&self, collection: &str, value: &str) -> RoutingResult<()> {
        for (range_id, token) in parse_compound_session_token(value)? {
            self.record(collection, &range_id, token).await;
        }
        Ok(())
    }

    /// Token to send with a read against `range`
    ///
    /// A range created by a split has not served any writes under its own id yet,
    /// so it inherits the most recent token among its parents.
    pub async fn resolve(&self, collection: &str, range: &PartitionKeyRange) -> Option<String> {
        let tokens = self.tokens.read().await;
        let ranges = tokens.get(collection)?;

        let token = ranges.get(&range.id).copied().or_else(|| {
            range
                .parents
                .iter()
                .filter_map(|parent| ranges.get(parent).copied())
                .reduce(SessionToken::merge)
        })?;

        Some(format!("{}:{}", range.id, token))
    }

    pub async fn get(&self, collection: &str, range_id: &str) -> Option<SessionToken> {
        let tokens = self.tokens.read().await;
        tokens.get(collection)?.get(range_id).copied()
    }

    /// Forget a collection, e.g. after it was deleted and recreated
    pub async fn clear(&self, collection: &str) -> usize {
        let mut tokens = self.tokens.write().await;
        tokens.remove(collection).map(|ranges| ranges.len()).unwrap_or(0)
    }

    pub async fn token_count(&self) -> usize {
        let tokens = self.tokens.read().await;
        tokens.values().map(HashMap::len).sum()
    }
}

impl Default for SessionContainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_token() {
        let token: SessionToken = "2#150".parse().unwrap();
        assert_eq!(token, SessionToken::new(2, 150));
        assert_eq!(token.to_string(), "2#150");

        let with_regions: SessionToken = "1#42#3=40#4=41".parse().unwrap();
        assert_eq!(with_regions, SessionToken::new(1, 42));

        assert!("garbage".parse::<SessionToken>().is_err());
        assert!("x#1".parse::<SessionToken>().is_err());
    }

    #[test]
    fn test_merge_is_monotonic() {
        let older = SessionToken::new(1, 100);
        let newer_lsn = SessionToken::new(1, 120);
        let newer_version = SessionToken::new(2, 5);

        assert_eq!(older.merge(newer_lsn), newer_lsn);
        assert_eq!(newer_lsn.merge(older), newer_lsn);
        assert_eq!(newer_lsn.merge(newer_version), newer_version);
        assert!(newer_version.is_as_recent_as(&older));
        assert!(!older.is_as_recent_as(&newer_lsn));
    }

    #[test]
    fn test_parse_compound() {
        let parsed = parse_compound_session_token("0:1#10,1:1#12").unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1], ("1".to_string(), SessionToken::new(1, 12)));
        assert!(parse_compound_session_token("1#12").is_err());
    }

    #[tokio::test]
    async fn test_container_never_moves_backwards() {
        let container = SessionContainer::new();
        container.record("orders", "0", SessionToken::new(1, 50)).await;
        container.record("orders", "0", SessionToken::new(1, 40)).await;

        assert_eq!(
            container.get("orders", "0").await,
            Some(SessionToken::new(1, 50))
        );
        assert_eq!(container.token_count().await, 1);
    }

    #[tokio::test]
    async fn test_child_range_inherits_parent_token() {
        let container = SessionContainer::new();
        container
            .record_compound("orders", "0:1#50,1:1#70")
            .await
            .unwrap();

        let child = PartitionKeyRange::new("2", "", "40")
            .unwrap()
            .with_parents(["0", "1"]);
        assert_eq!(
            container.resolve("orders", &child).await,
            Some("2:1#70".to_string())
        );

        let unrelated = PartitionKeyRange::new("9", "", "40").unwrap();
        assert_eq!(container.resolve("orders", &unrelated).await, None);

        assert_eq!(container.clear("orders").await, 2);
        assert_eq!(container.resolve("orders", &child).await, None);
    }
}
