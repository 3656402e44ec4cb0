//! Configuration for the batch flush policy and executor concurrency.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::ConfigError;

/// The default maximum number of items in a batch.
pub const DEFAULT_MAX_ITEMS_IN_BATCH: usize = 64;

/// The default maximum latency before a partial batch is flushed.
pub const DEFAULT_MAX_LATENCY: Duration = Duration::from_millis(100);

/// The maximum number of batches whose items can wait in the intake queue.
///
/// This avoids very large queues when callers configure a huge concurrency limit.
pub const QUEUE_BATCH_LIMIT: usize = 64;

/// The largest batch buffer allocated before any items arrive.
///
/// Batches with a larger size limit grow their buffers as items are added.
pub const MAX_BATCH_PREALLOCATION: usize = 1024;

/// The maximum number of batches that can be executing at the same time.
pub const MAX_CONCURRENT_BATCHES: usize = 1 << 16;

/// Pipeliner batching configuration.
///
/// The configuration is applied once, when the pipeliner is built.
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// The maximum number of items in a batch.
    ///
    /// A batch is flushed as soon as it reaches this size.
    /// If this is zero, batches are only flushed by `max_latency`.
    pub max_items_in_batch: usize,

    /// The maximum time the first item of a batch waits before the batch is flushed.
    ///
    /// If this is zero, batches are only flushed by `max_items_in_batch`.
    #[serde(with = "humantime_serde")]
    pub max_latency: Duration,

    /// The maximum number of batches that can be executing at the same time.
    ///
    /// When all the batch slots are executing, new items wait in the intake
    /// queue until a batch finishes. Zero is treated as one, so that batches
    /// run one at a time.
    pub max_concurrent_batches: usize,

    /// A deadline for each batch function call.
    ///
    /// The deadline is cooperative: the batch function is signalled through
    /// its [`BatchContext`](crate::BatchContext), but the pipeliner still
    /// waits for it to return.
    #[serde(with = "humantime_serde")]
    pub batch_timeout: Option<Duration>,
}

// we like our default configs to be explicit
#[allow(unknown_lints)]
#[allow(clippy::derivable_impls)]
impl Default for Config {
    fn default() -> Self {
        Self {
            max_items_in_batch: DEFAULT_MAX_ITEMS_IN_BATCH,
            max_latency: DEFAULT_MAX_LATENCY,
            max_concurrent_batches: 1,
            batch_timeout: None,
        }
    }
}

impl Config {
    /// Sets the batch window and size limit together, because they form one flush policy.
    pub fn with_window(mut self, max_latency: Duration, max_items_in_batch: usize) -> Self {
        self.max_latency = max_latency;
        self.max_items_in_batch = max_items_in_batch;
        self
    }

    /// Sets the maximum number of concurrently executing batches.
    pub fn with_concurrency(mut self, max_concurrent_batches: usize) -> Self {
        self.max_concurrent_batches = max_concurrent_batches;
        self
    }

    /// Sets the cooperative deadline for each batch function call.
    pub fn with_timeout(mut self, batch_timeout: Duration) -> Self {
        self.batch_timeout = Some(batch_timeout);
        self
    }

    /// Checks that at least one flush trigger is configured,
    /// and that the concurrency limit is supported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_items_in_batch == 0 && self.max_latency.is_zero() {
            return Err(ConfigError::NoFlushTrigger);
        }

        if self.max_concurrent_batches > MAX_CONCURRENT_BATCHES {
            return Err(ConfigError::TooManyConcurrentBatches {
                max_concurrent_batches: self.max_concurrent_batches,
                limit: MAX_CONCURRENT_BATCHES,
            });
        }

        Ok(())
    }

    /// Returns the number of batch slots, which is always at least one.
    pub(crate) fn batch_slots(&self) -> usize {
        self.max_concurrent_batches.max(1)
    }

    /// Returns the capacity to allocate for a new batch buffer.
    pub(crate) fn batch_capacity(&self) -> usize {
        self.max_items_in_batch.min(MAX_BATCH_PREALLOCATION)
    }

    /// Returns the batch timeout, treating a zero duration as no timeout.
    pub(crate) fn effective_timeout(&self) -> Option<Duration> {
        self.batch_timeout.filter(|timeout| !timeout.is_zero())
    }

    /// Returns the number of items that can wait in the intake queue.
    ///
    /// We allow one full batch per batch slot to wait,
    /// so that a new batch is ready to go when an executing batch finishes.
    /// Huge batch sizes are limited by the largest supported semaphore.
    pub(crate) fn intake_capacity(&self) -> usize {
        let items_per_batch = self.max_items_in_batch.max(1);

        items_per_batch
            .saturating_mul(self.batch_slots().clamp(1, QUEUE_BATCH_LIMIT))
            .min(Semaphore::MAX_PERMITS)
    }
}
