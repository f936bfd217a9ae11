//! Refresh Scheduler
//!
//! Background loop that keeps the cache's record categories fresh. Each
//! category carries its own staleness interval — instance state churns
//! hourly, subnets barely move, region names change once a blue moon — so
//! the loop wakes on a short fixed tick and re-queries only what has aged
//! out.
//!
//! A transient provider failure leaves the affected category stale and is
//! retried on the next tick; it never blocks the other categories or the
//! request server.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::SharedCache;
use crate::provider::ResourceProvider;

/// Record categories refreshed independently of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshCategory {
    /// Instance state across every region.
    Instances,
    /// Network interfaces across every region.
    Interfaces,
    /// Subnets across every region.
    Subnets,
    /// Human-readable region names.
    LongNames,
}

impl RefreshCategory {
    /// Every category, in refresh order.
    pub const ALL: [RefreshCategory; 4] = [
        RefreshCategory::Instances,
        RefreshCategory::Interfaces,
        RefreshCategory::Subnets,
        RefreshCategory::LongNames,
    ];

    /// The ts_dict key for this category.
    pub fn key(&self) -> &'static str {
        match self {
            RefreshCategory::Instances => "instances_in_all_regions",
            RefreshCategory::Interfaces => "interfaces_in_all_regions",
            RefreshCategory::Subnets => "subnets_in_all_regions",
            RefreshCategory::LongNames => "regions_long_names",
        }
    }

    /// Default maximum age before this category is refreshed again.
    pub fn default_interval(&self) -> Duration {
        match self {
            RefreshCategory::Instances => Duration::from_secs(3600 * 8),
            RefreshCategory::Interfaces => Duration::from_secs(3600 * 24 * 2),
            RefreshCategory::Subnets => Duration::from_secs(3600 * 24 * 2),
            RefreshCategory::LongNames => Duration::from_secs(3600 * 24 * 30),
        }
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often staleness is evaluated.
    pub tick: Duration,
    /// Per-category staleness intervals, in seconds, keyed by
    /// [`RefreshCategory::key`].
    pub intervals: BTreeMap<String, u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let intervals = RefreshCategory::ALL
            .iter()
            .map(|c| (c.key().to_string(), c.default_interval().as_secs()))
            .collect();
        Self {
            tick: Duration::from_secs(5),
            intervals,
        }
    }
}

/// Background worker that refreshes stale record categories.
pub struct RefreshScheduler {
    cache: SharedCache,
    provider: Arc<dyn ResourceProvider>,
    config: SchedulerConfig,
    /// Flipped by the process (ctrl-c) to stop the loop.
    shutdown: watch::Receiver<bool>,
    /// Flipped by the scheduler on exit to stop the request server's
    /// accept loop.
    server_stop: watch::Sender<bool>,
}

impl RefreshScheduler {
    /// Creates a scheduler over the given cache and provider.
    pub fn new(
        cache: SharedCache,
        provider: Arc<dyn ResourceProvider>,
        config: SchedulerConfig,
        shutdown: watch::Receiver<bool>,
        server_stop: watch::Sender<bool>,
    ) -> Self {
        Self {
            cache,
            provider,
            config,
            shutdown,
            server_stop,
        }
    }

    /// Starts the scheduler task.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Main refresh loop. Exits on the shutdown signal, then instructs the
    /// request server to stop accepting connections.
    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.tick);
        // The first tick fires immediately; that is fine, a fresh cache is
        // stale across the board anyway.
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.refresh_stale_categories().await;
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("refresh scheduler exiting");
        let _ = self.server_stop.send(true);
    }

    /// Refreshes every stale category, then flushes the cache if dirty.
    async fn refresh_stale_categories(&self) {
        let now = epoch_seconds();

        for category in RefreshCategory::ALL {
            if !self
                .cache
                .is_record_old_enough(now, &self.config.intervals, category.key())
            {
                continue;
            }

            info!("refreshing {}", category.key());
            match self.refresh_category(category).await {
                Ok(()) => {
                    self.cache.update_record_ts(category.key(), now);
                    info!("done refreshing {}", category.key());
                }
                Err(e) => {
                    // Category stays stale; retried on the next tick.
                    warn!("failed to refresh {}: {}", category.key(), e);
                }
            }
        }

        let cache = self.cache.clone();
        let flushed = tokio::task::spawn_blocking(move || cache.flush()).await;
        match flushed {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => warn!("cache flush skipped (snapshot locked), will retry"),
            Ok(Err(e)) => warn!("cache flush failed: {}", e),
            Err(e) => warn!("cache flush task failed: {}", e),
        }
    }

    /// Queries the provider for one category across all regions and merges
    /// the results into the cache.
    async fn refresh_category(&self, category: RefreshCategory) -> nimbus_common::Result<()> {
        let provider = self.provider.clone();
        let cache = self.cache.clone();

        tokio::task::spawn_blocking(move || -> nimbus_common::Result<()> {
            match category {
                RefreshCategory::Instances => {
                    for region in provider.regions() {
                        let (instances, has_running) = provider.list_instances(&region)?;
                        cache.set_region_instances(&region, instances, has_running);
                    }
                }
                RefreshCategory::Interfaces => {
                    for region in provider.regions() {
                        let mut interfaces = provider.list_interfaces(&region)?;
                        // Clients decide usage from instance attachments;
                        // every listed interface starts out available.
                        for record in interfaces.values_mut() {
                            if let Some(obj) = record.as_object_mut() {
                                obj.insert(
                                    "status".to_string(),
                                    serde_json::Value::String("available".to_string()),
                                );
                            }
                        }
                        cache.set_region_interfaces(&region, interfaces);
                    }
                }
                RefreshCategory::Subnets => {
                    for region in provider.regions() {
                        let subnets = provider.list_subnets(&region)?;
                        cache.set_region_subnets(&region, subnets);
                    }
                }
                RefreshCategory::LongNames => {
                    let names = provider.region_long_names()?;
                    cache.set_long_names(names);
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| {
            nimbus_common::NimbusError::Provider(format!("refresh task failed: {}", e))
        })?
    }
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_intervals_differ_by_category() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick, Duration::from_secs(5));
        assert_eq!(
            config.intervals["instances_in_all_regions"],
            3600 * 8
        );
        assert_eq!(
            config.intervals["interfaces_in_all_regions"],
            3600 * 24 * 2
        );
        assert_eq!(config.intervals["subnets_in_all_regions"], 3600 * 24 * 2);
        assert_eq!(config.intervals["regions_long_names"], 3600 * 24 * 30);
    }

    #[test]
    fn test_category_keys_are_distinct() {
        let mut keys: Vec<_> = RefreshCategory::ALL.iter().map(|c| c.key()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), RefreshCategory::ALL.len());
    }
}
