/// Request routing
///
/// `RequestRouter` resolves a request's target partition from the cached
/// routing map, waits for throughput admission, hands the attempt to the
/// transport and lets a request-scoped retry chain decide what happens when
/// the attempt fails.
use crate::core::partition::validate_effective_partition_key;
use crate::core::{KeySpace, PartitionKeyRange, Range, SessionContainer};
use crate::endpoint::{EndpointManager, RegionalEndpoint};
use crate::error::{RoutingError, RoutingResult};
use crate::retry::{RetryAction, RetryChain, RetryDecision, RetryOptions};
use crate::routing::{CollectionRoutingMap, PartitionKeyRangeCache};
use crate::throughput::ThroughputControlStore;
use crate::transport::{OperationRequest, RequestTarget, RoutedRequest, ServiceFailure, ServiceResponse, Transport};
use futures::future::try_join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Successful outcome of a routed request
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub response: ServiceResponse,
    pub partition_key_range_id: String,
    pub endpoint: RegionalEndpoint,
    /// Retries the chain granted before this response
    pub retries: u32,
}

/// What one attempt loop is aimed at
#[derive(Debug, Clone)]
enum Target {
    EffectivePartitionKey(String),
    PartitionKeyRangeId(String),
    /// Part of a cross-partition request
    SubRange(Range<String>),
}

enum Resolved {
    Partition(PartitionKeyRange),
    /// The sub-range now spans several partitions
    Split(Vec<Range<String>>),
    /// Known stale before sending anything
    Stale(ServiceFailure),
}

enum Outcome {
    Done(DispatchResponse),
    Split(Vec<Range<String>>),
}

pub struct RequestRouter {
    routing_cache: Arc<PartitionKeyRangeCache>,
    endpoints: Arc<EndpointManager>,
    transport: Arc<dyn Transport>,
    throughput: Arc<ThroughputControlStore>,
    sessions: Arc<SessionContainer>,
    retry_options: RetryOptions,
}

impl RequestRouter {
    pub fn new(
        routing_cache: Arc<PartitionKeyRangeCache>,
        endpoints: Arc<EndpointManager>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            routing_cache,
            endpoints,
            transport,
            throughput: Arc::new(ThroughputControlStore::default()),
            sessions: Arc::new(SessionContainer::new()),
            retry_options: RetryOptions::default(),
        }
    }

    pub fn with_throughput_store(mut self, throughput: Arc<ThroughputControlStore>) -> Self {
        self.throughput = throughput;
        self
    }

    pub fn with_retry_options(mut self, retry_options: RetryOptions) -> Self {
        self.retry_options = retry_options;
        self
    }

    pub fn with_session_container(mut self, sessions: Arc<SessionContainer>) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn routing_cache(&self) -> &Arc<PartitionKeyRangeCache> {
        &self.routing_cache
    }

    pub fn sessions(&self) -> &Arc<SessionContainer> {
        &self.sessions
    }

    /// Owning partition of a single-partition target, without dispatching
    pub async fn resolve(&self, collection: &str, target: &RequestTarget) -> RoutingResult<PartitionKeyRange> {
        let map = self.routing_cache.try_lookup(collection).await?;
        match single_target(target)? {
            Target::EffectivePartitionKey(key) => map.range_by_effective_partition_key(&key).cloned(),
            Target::PartitionKeyRangeId(id) => map.range_by_partition_key_range_id(&id).cloned(),
            Target::SubRange(_) => Err(RoutingError::internal("sub-range target from a single-partition request")),
        }
    }

    /// Route and send a single-partition request, retrying as the chain allows
    pub async fn resolve_and_dispatch(
        &self,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> RoutingResult<DispatchResponse> {
        let target = single_target(&request.target)?;
        match self.execute(request, target, cancel).await? {
            Outcome::Done(response) => Ok(response),
            Outcome::Split(_) => Err(RoutingError::internal("single-partition target resolved to several ranges")),
        }
    }

    /// Send a request to every partition its range overlaps, concurrently
    ///
    /// Responses come back in key order. Partitions that split while the
    /// request is in flight are re-resolved and their children queried.
    /// Single-partition targets are dispatched as one request.
    pub async fn dispatch_fan_out(
        &self,
        request: &OperationRequest,
        cancel: &CancellationToken,
    ) -> RoutingResult<Vec<DispatchResponse>> {
        let query = match &request.target {
            RequestTarget::Range(range) => range.clone(),
            _ => return Ok(vec![self.resolve_and_dispatch(request, cancel).await?]),
        };

        let mut pending = vec![query];
        let mut done: Vec<(Range<String>, DispatchResponse)> = Vec::new();

        while !pending.is_empty() {
            let batch: Vec<Range<String>> = std::mem::take(&mut pending);
            log::debug!(
                "Fanning out {} request {} over {} sub-ranges",
                request.operation,
                request.activity_id,
                batch.len()
            );

            let outcomes = try_join_all(batch.iter().map(|sub_range| {
                self.execute(request, Target::SubRange(sub_range.clone()), cancel)
            }))
            .await?;

            for (sub_range, outcome) in batch.into_iter().zip(outcomes) {
                match outcome {
                    Outcome::Done(response) => done.push((sub_range, response)),
                    Outcome::Split(children) => pending.extend(children),
                }
            }
        }

        done.sort_by(|(a, _), (b, _)| a.min_cmp(b));
        Ok(done.into_iter().map(|(_, response)| response).collect())
    }

    fn resolve_in(&self, map: &CollectionRoutingMap, target: &Target) -> RoutingResult<Resolved> {
        match target {
            Target::EffectivePartitionKey(key) => Ok(Resolved::Partition(
                map.range_by_effective_partition_key(key)?.clone(),
            )),
            Target::PartitionKeyRangeId(id) => Ok(match map.try_range_by_partition_key_range_id(id) {
                Some(range) => Resolved::Partition(range.clone()),
                None => Resolved::Stale(ServiceFailure::partition_key_range_gone()),
            }),
            Target::SubRange(query) => {
                let hits = map.overlapping_ranges(query);
                match hits.as_slice() {
                    [] => Err(RoutingError::inconsistent(
                        map.collection_unique_id(),
                        format!("no range overlaps {}", query),
                    )),
                    [single] => Ok(Resolved::Partition((*single).clone())),
                    many => many
                        .iter()
                        .map(|range| clip(query, &range.range))
                        .collect::<RoutingResult<Vec<_>>>()
                        .map(Resolved::Split),
                }
            }
        }
    }

    /// Attempt loop for one target
    async fn execute(
        &self,
        request: &OperationRequest,
        target: Target,
        cancel: &CancellationToken,
    ) -> RoutingResult<Outcome> {
        let collection = request.collection.as_str();
        let mut chain = RetryChain::new(&self.retry_options, self.endpoints.is_discovery_enabled());
        let controller = self.throughput.controller_for(request.throughput_group.as_deref());
        let mut map = self.routing_cache.try_lookup(collection).await?;
        let mut location_index = 0usize;

        loop {
            let endpoint = self.endpoints.resolve(location_index)?;

            let failure = match self.resolve_in(&map, &target)? {
                Resolved::Split(children) => return Ok(Outcome::Split(children)),
                Resolved::Stale(failure) => failure,
                Resolved::Partition(range) => {
                    let owner = map.owner_of(&range.id).cloned().ok_or_else(|| {
                        RoutingError::inconsistent(collection, format!("range {} has no owner", range.id))
                    })?;

                    let session_token = if request.needs_session_token() {
                        self.sessions.resolve(collection, &range).await
                    } else {
                        None
                    };

                    let admission = match &controller {
                        Some(controller) => Some(controller.admit(cancel).await?),
                        None => None,
                    };

                    let routed = RoutedRequest {
                        activity_id: request.activity_id.clone(),
                        collection: request.collection.clone(),
                        operation: request.operation,
                        partition_key_range_id: range.id.clone(),
                        owner,
                        endpoint: endpoint.clone(),
                        session_token,
                        payload: request.payload.clone(),
                        attempt: chain.attempts(),
                    };

                    log::debug!(
                        "Dispatching {} {} to range {} via {} (attempt {})",
                        request.operation,
                        request.activity_id,
                        range.id,
                        endpoint,
                        routed.attempt
                    );
                    let result = self.transport.send(routed).await;

                    let charge = match &result {
                        Ok(response) => response.request_charge,
                        Err(failure) => failure.request_charge,
                    };
                    if let (Some(controller), Some(admission)) = (&controller, admission) {
                        controller.record_charge(admission, charge).await;
                    }

                    match result {
                        Ok(response) => {
                            if let Some(token) = &response.session_token {
                                if let Err(e) = self.sessions.record_compound(collection, token).await {
                                    log::warn!("Ignoring malformed session token {:?}: {}", token, e);
                                }
                            }
                            return Ok(Outcome::Done(DispatchResponse {
                                response,
                                partition_key_range_id: range.id,
                                endpoint,
                                retries: chain.attempts(),
                            }));
                        }
                        Err(failure) => failure,
                    }
                }
            };

            let after = match chain.should_retry(&failure) {
                RetryDecision::Retry { after, action } => {
                    match action {
                        RetryAction::None => {}
                        RetryAction::RouteToLocation(index) => location_index = index,
                        RetryAction::RefreshTopology => {
                            self.endpoints.mark_unavailable(&endpoint);
                            if let Err(e) = self.endpoints.refresh_topology().await {
                                log::warn!("Topology refresh failed, retrying with known endpoints: {}", e);
                            }
                            location_index = 0;
                        }
                        RetryAction::RefreshRoutingMap => {
                            map = self.routing_cache.refresh(collection, Some(&map)).await?;
                        }
                    }
                    after
                }
                RetryDecision::NoRetry { exhausted } => {
                    if let Target::PartitionKeyRangeId(id) = &target {
                        if map.try_range_by_partition_key_range_id(id).is_none() && !map.is_gone(id) {
                            return Err(RoutingError::PartitionKeyRangeNotFound {
                                collection: collection.to_string(),
                                id: id.clone(),
                            });
                        }
                    }
                    return Err(match exhausted {
                        Some(policy) => RoutingError::RetriesExhausted {
                            policy,
                            attempts: chain.attempts(),
                            last: failure,
                        },
                        None => RoutingError::Service(failure),
                    });
                }
            };

            backoff(after, cancel).await?;
        }
    }
}

async fn backoff(after: Duration, cancel: &CancellationToken) -> RoutingResult<()> {
    if after.is_zero() {
        return Ok(());
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RoutingError::cancelled("retry backoff")),
        _ = tokio::time::sleep(after) => Ok(()),
    }
}

fn single_target(target: &RequestTarget) -> RoutingResult<Target> {
    match target {
        RequestTarget::PartitionKey(key) => Ok(Target::EffectivePartitionKey(key.effective_partition_key())),
        RequestTarget::EffectivePartitionKey(key) => {
            validate_effective_partition_key(key, &KeySpace::default())?;
            Ok(Target::EffectivePartitionKey(key.clone()))
        }
        RequestTarget::PartitionKeyRangeId(id) => Ok(Target::PartitionKeyRangeId(id.clone())),
        RequestTarget::Range(range) => Err(RoutingError::invalid_range(format!(
            "range target {} spans partitions, use dispatch_fan_out",
            range
        ))),
    }
}

/// Intersection of a query range with a partition's `[min, max)` range
fn clip(query: &Range<String>, partition: &Range<String>) -> RoutingResult<Range<String>> {
    let (min, is_min_inclusive) = if partition.min() > query.min() {
        (partition.min().clone(), true)
    } else {
        (query.min().clone(), query.is_min_inclusive())
    };
    let (max, is_max_inclusive) = if partition.max() <= query.max() {
        (partition.max().clone(), false)
    } else {
        (query.max().clone(), query.is_max_inclusive())
    };
    Range::new(min, max, is_min_inclusive, is_max_inclusive)
}
