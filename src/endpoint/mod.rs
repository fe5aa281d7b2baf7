/// Regional endpoint management
///
/// Keeps the ordered list of regional endpoints (preferred regions first),
/// temporarily excludes endpoints that failed, and re-reads the region
/// topology on demand.
use crate::error::{RoutingError, RoutingResult};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Default time an endpoint stays excluded after a failure
pub const DEFAULT_UNAVAILABILITY_TTL: Duration = Duration::from_secs(300);

/// One region of the account
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionalEndpoint {
    pub region: String,
    pub url: String,
}

impl RegionalEndpoint {
    pub fn new<S: Into<String>>(region: S, url: S) -> Self {
        Self {
            region: region.into(),
            url: url.into(),
        }
    }
}

impl fmt::Display for RegionalEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.region, self.url)
    }
}

/// Source of the current region topology
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn refresh_topology(&self) -> RoutingResult<Vec<RegionalEndpoint>>;
}

/// Topology source that serves whatever was last published to it
pub struct StaticTopologySource {
    endpoints: ArcSwap<Vec<RegionalEndpoint>>,
}

impl StaticTopologySource {
    pub fn new(endpoints: Vec<RegionalEndpoint>) -> Self {
        Self {
            endpoints: ArcSwap::from_pointee(endpoints),
        }
    }

    pub fn publish(&self, endpoints: Vec<RegionalEndpoint>) {
        self.endpoints.store(Arc::new(endpoints));
    }
}

#[async_trait]
impl TopologySource for StaticTopologySource {
    async fn refresh_topology(&self) -> RoutingResult<Vec<RegionalEndpoint>> {
        Ok(self.endpoints.load_full().as_ref().clone())
    }
}

/// Ordered regional endpoints with temporary unavailability marks
pub struct EndpointManager {
    endpoints: ArcSwap<Vec<RegionalEndpoint>>,
    unavailable: ArcSwap<FnvHashMap<String, Instant>>,
    preferred_regions: Vec<String>,
    discovery_enabled: bool,
    unavailability_ttl: Duration,
    topology: Option<Arc<dyn TopologySource>>,
}

impl EndpointManager {
    pub fn new(
        endpoints: Vec<RegionalEndpoint>,
        preferred_regions: Vec<String>,
        discovery_enabled: bool,
    ) -> Self {
        let ordered = order_by_preference(endpoints, &preferred_regions);
        Self {
            endpoints: ArcSwap::from_pointee(ordered),
            unavailable: ArcSwap::from_pointee(FnvHashMap::default()),
            preferred_regions,
            discovery_enabled,
            unavailability_ttl: DEFAULT_UNAVAILABILITY_TTL,
            topology: None,
        }
    }

    /// Single-region manager with discovery disabled
    pub fn single<S: Into<String>>(region: S, url: S) -> Self {
        Self::new(vec![RegionalEndpoint::new(region, url)], Vec::new(), false)
    }

    pub fn with_topology_source(mut self, source: Arc<dyn TopologySource>) -> Self {
        self.topology = Some(source);
        self
    }

    pub fn with_unavailability_ttl(mut self, ttl: Duration) -> Self {
        self.unavailability_ttl = ttl;
        self
    }

    pub fn is_discovery_enabled(&self) -> bool {
        self.discovery_enabled
    }

    /// All known endpoints in preference order
    pub fn endpoints(&self) -> Arc<Vec<RegionalEndpoint>> {
        self.endpoints.load_full()
    }

    /// Endpoints not currently marked unavailable, in preference order
    pub fn available_endpoints(&self) -> Vec<RegionalEndpoint> {
        let now = Instant::now();
        let unavailable = self.unavailable.load();
        self.endpoints
            .load()
            .iter()
            .filter(|endpoint| match unavailable.get(&endpoint.url) {
                Some(until) => *until <= now,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// Endpoint for the `location_index`-th attempt
    ///
    /// Indexes wrap around the available endpoints. When every endpoint is
    /// marked unavailable the full list is used again rather than failing.
    /// With discovery disabled the first endpoint is always returned.
    pub fn resolve(&self, location_index: usize) -> RoutingResult<RegionalEndpoint> {
        let all = self.endpoints.load();
        if all.is_empty() {
            return Err(RoutingError::metadata("no regional endpoints configured"));
        }

        if !self.discovery_enabled {
            return Ok(all[0].clone());
        }

        let available = self.available_endpoints();
        if available.is_empty() {
            log::warn!("All {} regional endpoints are marked unavailable, using full list", all.len());
            return Ok(all[location_index % all.len()].clone());
        }

        Ok(available[location_index % available.len()].clone())
    }

    /// Exclude an endpoint for the unavailability TTL
    pub fn mark_unavailable(&self, endpoint: &RegionalEndpoint) {
        let until = Instant::now() + self.unavailability_ttl;
        self.unavailable.rcu(|current| {
            let now = Instant::now();
            let mut next: FnvHashMap<String, Instant> = current
                .iter()
                .filter(|(_, expiry)| **expiry > now)
                .map(|(url, expiry)| (url.clone(), *expiry))
                .collect();
            next.insert(endpoint.url.clone(), until);
            next
        });
        log::warn!(
            "Marked endpoint {} unavailable for {:?}",
            endpoint,
            self.unavailability_ttl
        );
    }

    pub fn is_unavailable(&self, endpoint: &RegionalEndpoint) -> bool {
        self.unavailable
            .load()
            .get(&endpoint.url)
            .map(|until| *until > Instant::now())
            .unwrap_or(false)
    }

    /// Re-read the region topology and publish it
    ///
    /// Returns the number of endpoints now known. Without a topology source
    /// the current list is kept.
    pub async fn refresh_topology(&self) -> RoutingResult<usize> {
        let source = match &self.topology {
            Some(source) => source,
            None => return Ok(self.endpoints.load().len()),
        };

        let fresh = source.refresh_topology().await?;
        if fresh.is_empty() {
            return Err(RoutingError::metadata("topology source returned no endpoints"));
        }

        let ordered = order_by_preference(fresh, &self.preferred_regions);
        let count = ordered.len();
        self.endpoints.store(Arc::new(ordered));
        log::info!("Refreshed region topology: {} endpoints", count);
        Ok(count)
    }
}

/// Preferred regions first (in the listed order), then the rest as supplied
fn order_by_preference(endpoints: Vec<RegionalEndpoint>, preferred: &[String]) -> Vec<RegionalEndpoint> {
    let rank = |endpoint: &RegionalEndpoint| {
        preferred
            .iter()
            .position(|region| region.eq_ignore_ascii_case(&endpoint.region))
            .unwrap_or(preferred.len())
    };

    let mut ordered = endpoints;
    // Stable sort keeps the supplied order among equally ranked endpoints
    ordered.sort_by_key(rank);
    ordered
}
