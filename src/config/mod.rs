/// Configuration management for ruta

use crate::core::{PartitionKeyRange, ServerIdentity};
use crate::endpoint::{EndpointManager, RegionalEndpoint};
use crate::retry::RetryOptions;
use crate::routing::{CollectionRoutingMap, RangeWithOwner, StaticMetadataSource};
use crate::throughput::{ThroughputControlGroup, ThroughputTarget};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main ruta configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: ClientConfig,
    /// Retry budgets
    pub retry: RetryConfig,
    /// Throughput control groups
    #[serde(default)]
    pub throughput: ThroughputConfig,
    /// Routing metadata
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Collection requests are routed for
    pub collection: String,
    /// Fail over to other regions when an endpoint is unreachable
    pub enable_endpoint_discovery: bool,
    /// Regions tried first, in order
    #[serde(default)]
    pub preferred_regions: Vec<String>,
    /// Regional endpoints of the account
    pub endpoints: Vec<RegionalEndpoint>,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retries of throttled (429) requests
    pub max_throttle_retry_attempts: u32,
    /// Cumulative throttle backoff allowed per request, in seconds
    pub max_throttle_wait_sec: u64,
    /// Backoff when the service omits retry-after, in milliseconds
    pub default_throttle_retry_after_ms: u64,
    /// Maximum retries of read-session-not-available failures
    pub max_session_read_retry_attempts: u32,
    pub session_read_initial_backoff_ms: u64,
    pub session_read_max_backoff_ms: u64,
    /// Region failovers per request
    pub max_endpoint_failover_retries: u32,
    pub endpoint_retry_interval_ms: u64,
    /// Routing map refreshes per request
    pub max_partition_key_mismatch_retries: u32,
}

/// Throughput control configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThroughputConfig {
    /// Provisioned throughput of the container in RU/s, used by threshold targets
    pub container_throughput: f64,
    #[serde(default)]
    pub groups: Vec<ThroughputGroupConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    Local,
    Global,
}

/// A throughput control group
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputGroupConfig {
    pub name: String,
    pub mode: GroupMode,
    /// Absolute budget in RU/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_throughput: Option<f64>,
    /// Fraction of the container throughput
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_threshold: Option<f64>,
    #[serde(default)]
    pub is_default: bool,
    /// How often a global group re-reads its shared budget, in seconds
    #[serde(default = "default_renew_interval_sec")]
    pub renew_interval_sec: u64,
}

fn default_renew_interval_sec() -> u64 {
    5
}

/// Routing metadata configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Background routing map refresh interval in seconds (0 disables it)
    #[serde(default)]
    pub refresh_interval_sec: u64,
    /// Static partition layout served in place of the metadata service
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub id: String,
    /// Minimum effective partition key (inclusive)
    pub min: String,
    /// Maximum effective partition key (exclusive)
    pub max: String,
    /// Replica set serving the range
    pub owner: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, structured)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        let defaults = RetryOptions::default();
        Self {
            client: ClientConfig {
                collection: "orders".to_string(),
                enable_endpoint_discovery: true,
                preferred_regions: vec!["West US".to_string()],
                endpoints: vec![
                    RegionalEndpoint::new("West US", "https://account-westus.documents.example.com"),
                    RegionalEndpoint::new("East US", "https://account-eastus.documents.example.com"),
                ],
            },
            retry: RetryConfig {
                max_throttle_retry_attempts: defaults.max_throttle_retry_attempts,
                max_throttle_wait_sec: defaults.max_throttle_wait.as_secs(),
                default_throttle_retry_after_ms: defaults.default_throttle_retry_after.as_millis() as u64,
                max_session_read_retry_attempts: defaults.max_session_read_retry_attempts,
                session_read_initial_backoff_ms: defaults.session_read_initial_backoff.as_millis() as u64,
                session_read_max_backoff_ms: defaults.session_read_max_backoff.as_millis() as u64,
                max_endpoint_failover_retries: defaults.max_endpoint_failover_retries,
                endpoint_retry_interval_ms: defaults.endpoint_retry_interval.as_millis() as u64,
                max_partition_key_mismatch_retries: defaults.max_partition_key_mismatch_retries,
            },
            throughput: ThroughputConfig {
                container_throughput: 10_000.0,
                groups: Vec::new(),
            },
            routing: RoutingConfig {
                refresh_interval_sec: 60,
                partitions: vec![
                    partition("0", "", "10", "rs-0"),
                    partition("1", "10", "20", "rs-1"),
                    partition("2", "20", "30", "rs-2"),
                    partition("3", "30", "FF", "rs-3"),
                ],
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

fn partition(id: &str, min: &str, max: &str, owner: &str) -> PartitionConfig {
    PartitionConfig {
        id: id.to_string(),
        min: min.to_string(),
        max: max.to_string(),
        owner: owner.to_string(),
        parents: Vec::new(),
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate client config
        if self.client.collection.trim().is_empty() {
            return Err(ConfigError::ValidationError("collection cannot be empty".to_string()));
        }

        if self.client.endpoints.is_empty() {
            return Err(ConfigError::ValidationError("endpoints cannot be empty".to_string()));
        }

        for endpoint in &self.client.endpoints {
            if endpoint.region.trim().is_empty() || endpoint.url.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid endpoint: {}",
                    endpoint
                )));
            }
        }

        // Validate retry config
        if self.retry.max_throttle_retry_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "max_throttle_retry_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_throttle_wait_sec == 0 {
            return Err(ConfigError::ValidationError(
                "max_throttle_wait_sec must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_partition_key_mismatch_retries == 0 {
            return Err(ConfigError::ValidationError(
                "max_partition_key_mismatch_retries must be greater than 0".to_string(),
            ));
        }

        if self.retry.session_read_initial_backoff_ms > self.retry.session_read_max_backoff_ms {
            return Err(ConfigError::ValidationError(
                "session_read_initial_backoff_ms must not exceed session_read_max_backoff_ms".to_string(),
            ));
        }

        // Validate throughput config
        self.throughput_groups()?;

        // Validate static routing layout
        if !self.routing.partitions.is_empty() {
            CollectionRoutingMap::try_create(&self.client.collection, self.static_partitions()?, None)
                .map_err(|e| ConfigError::ValidationError(format!("Invalid static partitions: {}", e)))?;
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "structured" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    pub fn retry_options(&self) -> RetryOptions {
        RetryOptions {
            max_throttle_retry_attempts: self.retry.max_throttle_retry_attempts,
            max_throttle_wait: Duration::from_secs(self.retry.max_throttle_wait_sec),
            default_throttle_retry_after: Duration::from_millis(self.retry.default_throttle_retry_after_ms),
            max_session_read_retry_attempts: self.retry.max_session_read_retry_attempts,
            session_read_initial_backoff: Duration::from_millis(self.retry.session_read_initial_backoff_ms),
            session_read_max_backoff: Duration::from_millis(self.retry.session_read_max_backoff_ms),
            max_endpoint_failover_retries: self.retry.max_endpoint_failover_retries,
            endpoint_retry_interval: Duration::from_millis(self.retry.endpoint_retry_interval_ms),
            max_partition_key_mismatch_retries: self.retry.max_partition_key_mismatch_retries,
        }
    }

    /// Throughput control groups, checked for consistency
    pub fn throughput_groups(&self) -> Result<Vec<ThroughputControlGroup>, ConfigError> {
        let mut names = HashSet::new();
        let mut default_group: Option<&str> = None;
        let mut groups = Vec::with_capacity(self.throughput.groups.len());

        for group in &self.throughput.groups {
            if group.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "throughput group name cannot be empty".to_string(),
                ));
            }
            if !names.insert(group.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "Duplicate throughput group: {}",
                    group.name
                )));
            }
            if group.is_default {
                if let Some(existing) = default_group {
                    return Err(ConfigError::ValidationError(format!(
                        "Throughput groups {} and {} are both marked default",
                        existing, group.name
                    )));
                }
                default_group = Some(&group.name);
            }

            let target = match (group.target_throughput, group.target_threshold) {
                (Some(throughput), None) if throughput > 0.0 => ThroughputTarget::Absolute(throughput),
                (None, Some(threshold)) if threshold > 0.0 && threshold <= 1.0 => {
                    if self.throughput.container_throughput <= 0.0 {
                        return Err(ConfigError::ValidationError(format!(
                            "Throughput group {} uses a threshold but container_throughput is not set",
                            group.name
                        )));
                    }
                    ThroughputTarget::Threshold(threshold)
                }
                (Some(_), None) => {
                    return Err(ConfigError::ValidationError(format!(
                        "Throughput group {}: target_throughput must be greater than 0",
                        group.name
                    )))
                }
                (None, Some(_)) => {
                    return Err(ConfigError::ValidationError(format!(
                        "Throughput group {}: target_threshold must be in (0, 1]",
                        group.name
                    )))
                }
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "Throughput group {} must set exactly one of target_throughput or target_threshold",
                        group.name
                    )))
                }
            };

            let control_group = match group.mode {
                GroupMode::Local => ThroughputControlGroup::local(group.name.clone(), target),
                GroupMode::Global => {
                    if group.renew_interval_sec == 0 {
                        return Err(ConfigError::ValidationError(format!(
                            "Throughput group {}: renew_interval_sec must be greater than 0",
                            group.name
                        )));
                    }
                    ThroughputControlGroup::global(
                        group.name.clone(),
                        target,
                        Duration::from_secs(group.renew_interval_sec),
                    )
                }
            };

            groups.push(if group.is_default {
                control_group.as_default()
            } else {
                control_group
            });
        }

        Ok(groups)
    }

    /// Endpoint manager over the configured regions
    pub fn endpoint_manager(&self) -> EndpointManager {
        EndpointManager::new(
            self.client.endpoints.clone(),
            self.client.preferred_regions.clone(),
            self.client.enable_endpoint_discovery,
        )
    }

    pub fn static_partitions(&self) -> Result<Vec<RangeWithOwner>, ConfigError> {
        self.routing
            .partitions
            .iter()
            .map(|p| {
                let range = PartitionKeyRange::new(p.id.as_str(), p.min.as_str(), p.max.as_str())
                    .map_err(|e| ConfigError::ValidationError(format!("Invalid partition {}: {}", p.id, e)))?;
                Ok((range.with_parents(p.parents.iter().cloned()), ServerIdentity::new(p.owner.as_str())))
            })
            .collect()
    }

    /// Metadata source serving the static layout of the configured collection
    pub fn metadata_source(&self) -> Result<StaticMetadataSource, ConfigError> {
        if self.routing.partitions.is_empty() {
            return Err(ConfigError::ValidationError(
                "routing.partitions is empty, no static layout to serve".to_string(),
            ));
        }

        Ok(StaticMetadataSource::new().with_collection(self.client.collection.clone(), self.static_partitions()?))
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        match self.routing.refresh_interval_sec {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, profile: &str) -> Result<(), ConfigError> {
        let groups = match profile {
            "local" => vec![
                ThroughputGroupConfig {
                    name: "interactive".to_string(),
                    mode: GroupMode::Local,
                    target_throughput: None,
                    target_threshold: Some(0.5),
                    is_default: true,
                    renew_interval_sec: default_renew_interval_sec(),
                },
                ThroughputGroupConfig {
                    name: "batch".to_string(),
                    mode: GroupMode::Local,
                    target_throughput: Some(1_000.0),
                    target_threshold: None,
                    is_default: false,
                    renew_interval_sec: default_renew_interval_sec(),
                },
            ],
            "global" => vec![ThroughputGroupConfig {
                name: "shared".to_string(),
                mode: GroupMode::Global,
                target_throughput: Some(2_000.0),
                target_threshold: None,
                is_default: true,
                renew_interval_sec: 5,
            }],
            _ => {
                return Err(ConfigError::ValidationError(
                    "Profile must be 'local' or 'global'".to_string(),
                ))
            }
        };

        let mut config = Config::default();
        config.throughput.groups = groups;
        config.save_to_file(path)
    }
}
