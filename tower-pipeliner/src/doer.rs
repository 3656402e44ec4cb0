//! Batch functions, and the context passed to each batch function call.

use std::{fmt, future::Future, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::BoxError;

/// A batch function: processes every item of one batch, and returns a single
/// result for the whole batch.
///
/// Every caller with an item in the batch receives the same result.
/// The batch function can be called again before a previous call finishes,
/// if the pipeliner allows more than one concurrent batch.
///
/// Closures can be used as batch functions with [`doer_fn`] and [`doer_fn_with_context`].
pub trait Doer<Item>: Send + Sync + 'static {
    /// The error returned when a batch fails.
    type Error: Into<BoxError>;

    /// The future that completes when the batch is processed.
    type Future: Future<Output = Result<(), Self::Error>> + Send + 'static;

    /// Starts processing `items`, in submission order.
    fn call(&self, ctx: BatchContext, items: Vec<Item>) -> Self::Future;
}

/// Per-batch information and deadline signal, passed to each batch function call.
#[derive(Clone)]
pub struct BatchContext {
    batch_id: u64,
    len: usize,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl BatchContext {
    pub(crate) fn new(batch_id: u64, len: usize, timeout: Option<Duration>) -> BatchContext {
        BatchContext {
            batch_id,
            len,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// A sequence number for this batch, unique within its pipeliner.
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    /// The number of items in this batch.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if this batch has no items.
    ///
    /// The pipeliner never calls a batch function with an empty batch.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The time when this batch's timeout expires, if it has one.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns `true` once the batch timeout has expired.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Waits until the batch timeout expires.
    ///
    /// Never completes if the batch has no timeout.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchContext")
            .field("batch_id", &self.batch_id)
            .field("len", &self.len)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Returns a [`Doer`] that calls `f` with the items in each batch.
pub fn doer_fn<F>(f: F) -> DoerFn<F> {
    DoerFn { f }
}

/// Returns a [`Doer`] that calls `f` with the batch context and the items in each batch.
///
/// Use this when the batch function needs to observe the batch timeout.
pub fn doer_fn_with_context<F>(f: F) -> DoerFnWithContext<F> {
    DoerFnWithContext { f }
}

/// A [`Doer`] created from a closure taking the batch items.
///
/// See [`doer_fn`].
#[derive(Copy, Clone)]
pub struct DoerFn<F> {
    f: F,
}

impl<F> fmt::Debug for DoerFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoerFn")
            .field("f", &format_args!("{}", std::any::type_name::<F>()))
            .finish()
    }
}

impl<F, Item, Fut, E> Doer<Item> for DoerFn<F>
where
    F: Fn(Vec<Item>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    type Error = E;
    type Future = Fut;

    fn call(&self, _ctx: BatchContext, items: Vec<Item>) -> Self::Future {
        (self.f)(items)
    }
}

/// A [`Doer`] created from a closure taking the batch context and items.
///
/// See [`doer_fn_with_context`].
#[derive(Copy, Clone)]
pub struct DoerFnWithContext<F> {
    f: F,
}

impl<F> fmt::Debug for DoerFnWithContext<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DoerFnWithContext")
            .field("f", &format_args!("{}", std::any::type_name::<F>()))
            .finish()
    }
}

impl<F, Item, Fut, E> Doer<Item> for DoerFnWithContext<F>
where
    F: Fn(BatchContext, Vec<Item>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    type Error = E;
    type Future = Fut;

    fn call(&self, ctx: BatchContext, items: Vec<Item>) -> Self::Future {
        (self.f)(ctx, items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn doer_fn_ignores_context() {
        let doer = doer_fn(|items: Vec<u32>| async move {
            if items.iter().sum::<u32>() > 10 {
                Err("too big")
            } else {
                Ok(())
            }
        });

        let ctx = BatchContext::new(0, 2, None);
        assert!(doer.call(ctx.clone(), vec![1, 2]).await.is_ok());
        assert_eq!(doer.call(ctx, vec![5, 6]).await, Err("too big"));
    }

    #[tokio::test]
    async fn doer_fn_with_context_sees_batch_details() {
        let doer = doer_fn_with_context(|ctx: BatchContext, items: Vec<&'static str>| async move {
            assert_eq!(ctx.len(), items.len());
            assert_eq!(ctx.batch_id(), 7);
            assert!(ctx.deadline().is_some());
            Ok::<(), BoxError>(())
        });

        let ctx = BatchContext::new(7, 1, Some(Duration::from_secs(1)));
        assert!(doer.call(ctx, vec!["a"]).await.is_ok());
    }

    #[tokio::test]
    async fn context_cancellation_is_shared_between_clones() {
        let ctx = BatchContext::new(0, 1, Some(Duration::from_millis(1)));
        let observer = ctx.clone();

        assert!(!observer.is_cancelled());
        ctx.cancel_token().cancel();

        observer.cancelled().await;
        assert!(observer.is_cancelled());
    }
}
