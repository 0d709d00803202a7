//! Config for the collection metadata and partition routing caches.

use std::time::Duration;

/// How routing maps are cached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RoutingMapCacheMode {
    /// Serve the cached map while a refresh runs in the background.
    ///
    /// Only callers that asked for the refresh wait for it.
    #[default]
    StaleServing,

    /// At most one build per collection, every caller waits for a running build.
    SingleFlight,
}

/// CLI config for the metadata caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::Parser)]
pub struct MetadataCacheConfig {
    /// Caching strategy for partition routing maps.
    #[clap(
        long = "routing-map-cache-mode",
        env = "METADATA_CACHE_ROUTING_MAP_MODE",
        default_value = "stale-serving",
        value_enum
    )]
    pub routing_map_cache_mode: RoutingMapCacheMode,

    /// Upper bound for a single metadata fetch.
    ///
    /// A fetch that takes longer fails with a transient error.
    #[clap(
        long = "metadata-fetch-timeout",
        env = "METADATA_CACHE_FETCH_TIMEOUT",
        default_value = "10s",
        value_parser = parse_fetch_timeout,
    )]
    pub fetch_timeout: Duration,
}

impl Default for MetadataCacheConfig {
    fn default() -> Self {
        Self {
            routing_map_cache_mode: RoutingMapCacheMode::default(),
            fetch_timeout: Duration::from_secs(10),
        }
    }
}

fn parse_fetch_timeout(s: &str) -> Result<Duration, String> {
    let timeout = humantime::parse_duration(s).map_err(|e| e.to_string())?;
    if timeout.is_zero() {
        return Err("fetch timeout must be greater than zero".to_owned());
    }
    Ok(timeout)
}
