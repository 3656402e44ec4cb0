//! Error types for the `Pipeliner` scheduler.

use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::BoxError;

/// An error returned by a batch function, shared by every item in that batch.
///
/// All the callers in a batch get a clone of the same `Arc`, so they can check
/// that they failed together using [`BatchError::ptr_eq`].
#[derive(Clone)]
pub struct BatchError {
    inner: Arc<BoxError>,
}

impl BatchError {
    pub(crate) fn new(inner: BoxError) -> BatchError {
        BatchError {
            inner: Arc::new(inner),
        }
    }

    /// Returns `true` if `self` and `other` came from the same batch function call.
    pub fn ptr_eq(&self, other: &BatchError) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Returns a reference to the error returned by the batch function.
    pub fn inner(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
        &**self.inner
    }
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl fmt::Debug for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BatchError").field(&self.inner).finish()
    }
}

impl std::error::Error for BatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&**self.inner)
    }
}

/// The result of submitting one item to a [`Pipeliner`](crate::Pipeliner).
#[derive(Clone, Debug, Error)]
pub enum PipelineError {
    /// The batch function returned an error for the batch containing this item.
    #[error(transparent)]
    Batch(#[from] BatchError),

    /// The batch function panicked while processing the batch containing this item.
    #[error("batch function panicked: {0}")]
    Panicked(String),

    /// The pipeliner worker has shut down, so the item was never batched.
    #[error("pipeliner worker closed unexpectedly")]
    Closed,
}

impl PipelineError {
    /// Returns the shared batch function error, if there is one.
    pub fn batch_error(&self) -> Option<&BatchError> {
        match self {
            PipelineError::Batch(error) => Some(error),
            _ => None,
        }
    }
}

/// An invalid [`Config`](crate::Config), rejected when the pipeliner is built.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ConfigError {
    /// Neither the size limit nor the window can flush a batch,
    /// so submitted items would wait forever.
    #[error("max_items_in_batch and max_latency are both zero: batches would never be flushed")]
    NoFlushTrigger,

    /// The concurrency limit is larger than the pipeliner supports.
    #[error("max_concurrent_batches is {max_concurrent_batches}, but the limit is {limit}")]
    TooManyConcurrentBatches {
        /// The configured concurrency limit.
        max_concurrent_batches: usize,
        /// The largest supported concurrency limit.
        limit: usize,
    },
}
