pub mod config;
pub mod error;
/// Ruta - partition-aware request routing for partitioned document stores
///
/// Ruta sits between an application and a horizontally partitioned store:
/// 1. Routing: maps partition keys onto cached, immutable snapshots of the
///    collection's partition key ranges, refreshed incrementally on splits and merges
/// 2. Retries: a request-scoped chain of policies for throttling, session reads,
///    regional failover and stale routing
/// 3. Throughput control: request-unit budgets per logical group, local or
///    coordinated across clients
pub mod core;
pub mod endpoint;
pub mod retry;
pub mod router;
pub mod routing;
pub mod throughput;
pub mod transport;
pub mod utils;

pub use crate::config::Config;
pub use crate::core::{PartitionKey, PartitionKeyRange, Range};
pub use crate::error::{RoutingError, RoutingResult};
pub use crate::router::{DispatchResponse, RequestRouter};
pub use crate::routing::{CollectionRoutingMap, MetadataSource, PartitionKeyRangeCache};
pub use crate::throughput::BudgetStore;
pub use crate::transport::{OperationRequest, ServiceFailure, ServiceResponse, Transport};

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::throughput::ThroughputControlStore;

/// A configured client: the request router plus its background tasks
pub struct Ruta {
    config: Config,
    router: Option<Arc<RequestRouter>>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Ruta {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            router: None,
            cancel: CancellationToken::new(),
            background: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Build the router and start background refresh tasks
    ///
    /// Must be called from within a Tokio runtime. Global throughput groups
    /// need a `budget_store`.
    pub fn initialize(
        &mut self,
        transport: Arc<dyn Transport>,
        metadata: Arc<dyn MetadataSource>,
        budget_store: Option<Arc<dyn BudgetStore>>,
    ) -> RoutingResult<Arc<RequestRouter>> {
        if let Some(router) = &self.router {
            return Ok(router.clone());
        }

        self.config.validate()?;
        let groups = self.config.throughput_groups()?;
        let throughput =
            ThroughputControlStore::new(&groups, self.config.throughput.container_throughput, budget_store)?;
        let routing_cache = Arc::new(PartitionKeyRangeCache::new(metadata));

        self.background.extend(throughput.spawn_background_tasks(&self.cancel));
        if let Some(interval) = self.config.refresh_interval() {
            self.background.push(
                routing_cache
                    .clone()
                    .spawn_background_refresh(interval, self.cancel.child_token()),
            );
        }

        let router = Arc::new(
            RequestRouter::new(routing_cache, Arc::new(self.config.endpoint_manager()), transport)
                .with_throughput_store(Arc::new(throughput))
                .with_retry_options(self.config.retry_options()),
        );

        log::info!(
            "Ruta initialized for collection {} ({} endpoints, {} throughput groups, {} background tasks)",
            self.config.client.collection,
            self.config.client.endpoints.len(),
            groups.len(),
            self.background.len()
        );

        self.router = Some(router.clone());
        Ok(router)
    }

    pub fn is_initialized(&self) -> bool {
        self.router.is_some()
    }

    pub fn router(&self) -> Option<&Arc<RequestRouter>> {
        self.router.as_ref()
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }
        log::info!("Ruta shut down");
    }
}
