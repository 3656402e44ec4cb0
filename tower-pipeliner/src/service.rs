//! Handle service for submitting items to a pipeliner worker.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures_core::ready;
use tokio::{
    pin,
    sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
};
use tokio_util::sync::PollSemaphore;
use tower::Service;
use tracing::{info_span, Instrument};

use super::{
    config::Config,
    doer::Doer,
    error::{ConfigError, PipelineError},
    future::ResponseFuture,
    message::Message,
    worker::Worker,
};

/// Coalesces items submitted by concurrent callers into batches,
/// and returns each batch's result to every caller in that batch.
///
/// `Pipeliner` is a cheap handle: clone it to submit items from many tasks.
/// The worker task exits after every handle is dropped and every batch has finished.
///
/// See the crate documentation for more details.
pub struct Pipeliner<Item> {
    // Intake
    //
    /// A custom-bounded channel for sending items to the pipeliner worker.
    ///
    /// Note: this actually _is_ bounded, but rather than using Tokio's bounded
    /// channel, we use Tokio's semaphore separately to implement the bound.
    tx: mpsc::UnboundedSender<Message<Item>>,

    /// A semaphore used to bound the channel.
    ///
    /// When the intake channel is full, we want to exert backpressure in
    /// `poll_ready`, so that callers can choose to wait or shed load.
    ///
    /// Tokio's bounded MPSC channel doesn't wake pending tasks on close,
    /// so we implement our own bounded MPSC on top of the unbounded channel,
    /// using a semaphore to limit how many items are in the channel.
    semaphore: PollSemaphore,

    /// A semaphore permit that allows this handle to send one message on `tx`.
    permit: Option<OwnedSemaphorePermit>,

    // Errors
    //
    /// A worker task handle shared between all handle clones for the same worker.
    ///
    /// Only used when the worker is spawned on the tokio runtime.
    worker_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<Item> fmt::Debug for Pipeliner<Item> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<Self>();
        f.debug_struct(name)
            .field("tx", &self.tx)
            .field("semaphore", &self.semaphore)
            .field("permit", &self.permit)
            .field("worker_handle", &self.worker_handle)
            .finish()
    }
}

impl<Item> Pipeliner<Item>
where
    Item: Send + 'static,
{
    /// Creates a new `Pipeliner` that runs `doer` on batches of submitted items.
    ///
    /// These [`Config`] fields control the batching policy:
    ///
    /// * `max_items_in_batch` flushes a batch as soon as it has this many items.
    /// * `max_latency` flushes a batch this long after its first item arrived.
    /// * `max_concurrent_batches` is the number of batches that can execute at
    ///   the same time. When they are all executing, new items wait.
    /// * `batch_timeout` is a cooperative deadline for each `doer` call.
    ///
    /// Returns an error if neither `max_items_in_batch` nor `max_latency` can
    /// flush a batch, or if `max_concurrent_batches` is too large.
    ///
    /// The default Tokio executor is used to run the worker and batches, which
    /// means that this method must be called while on the Tokio runtime.
    pub fn new<D>(doer: D, config: Config) -> Result<Self, ConfigError>
    where
        D: Doer<Item>,
    {
        config.validate()?;

        Ok(Self::spawn(doer, config))
    }

    /// Creates a new `Pipeliner` with a validated `config`, and spawns its worker.
    pub(crate) fn spawn<D>(doer: D, config: Config) -> Self
    where
        D: Doer<Item>,
    {
        let (mut pipeliner, worker) = Self::pair_unchecked(doer, config);

        let span = info_span!("pipeliner worker", kind = std::any::type_name::<D>());
        let worker_handle = tokio::spawn(worker.run().instrument(span));

        pipeliner.register_worker(worker_handle);

        pipeliner
    }

    /// Creates a new `Pipeliner` running `doer`, but returns the background worker.
    ///
    /// This is useful if you do not want to spawn directly onto the `tokio`
    /// runtime but instead want to use your own executor. This will return the
    /// `Pipeliner` and the background `Worker` that you can then spawn.
    /// Batches are still spawned onto the Tokio runtime.
    pub fn pair<D>(doer: D, config: Config) -> Result<(Self, Worker<D, Item>), ConfigError>
    where
        D: Doer<Item>,
    {
        config.validate()?;

        Ok(Self::pair_unchecked(doer, config))
    }

    fn pair_unchecked<D>(doer: D, config: Config) -> (Self, Worker<D, Item>)
    where
        D: Doer<Item>,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        // The semaphore bound limits the number of items waiting in the intake queue
        // (specifically, items which got a permit, but haven't been taken by the worker yet).
        let semaphore = Semaphore::new(config.intake_capacity());
        let semaphore = PollSemaphore::new(Arc::new(semaphore));

        let worker = Worker::new(doer, rx, config, semaphore.clone());

        let pipeliner = Pipeliner {
            tx,
            semaphore,
            permit: None,
            worker_handle: Arc::new(Mutex::new(None)),
        };

        (pipeliner, worker)
    }

    /// Ask the `Pipeliner` to monitor the spawned worker task's [`JoinHandle`].
    ///
    /// Only used when the task is spawned on the tokio runtime.
    pub fn register_worker(&mut self, worker_handle: JoinHandle<()>) {
        *self
            .worker_handle
            .lock()
            .expect("previous task panicked while holding the worker handle mutex") =
            Some(worker_handle);
    }

    /// Submits `item`, and waits until the batch containing it has been processed.
    ///
    /// Returns the result of the batch function for that batch. Every item in
    /// the same batch gets the same result.
    ///
    /// Waits for intake capacity if the pipeliner is saturated.
    /// There is no caller-side timeout: if the batch function never returns,
    /// the returned future never completes.
    pub fn submit(
        &self,
        item: Item,
    ) -> impl Future<Output = Result<(), PipelineError>> + Send + 'static {
        let semaphore = self.semaphore.clone_inner();
        let tx = self.tx.clone();
        let span = tracing::Span::current();

        async move {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_closed| PipelineError::Closed)?;

            let response = send(&tx, item, permit, span);

            // The worker exits once every sender is dropped, so don't hold ours while waiting.
            drop(tx);

            response.await
        }
    }
}

/// Sends `item` to the worker using an acquired intake `permit`.
///
/// The caller's `span` is propagated to the worker. If we didn't do this, events on
/// the worker related to this span wouldn't be counted towards that span,
/// since the worker would have no way of entering it.
fn send<Item>(
    tx: &mpsc::UnboundedSender<Message<Item>>,
    item: Item,
    permit: OwnedSemaphorePermit,
    span: tracing::Span,
) -> ResponseFuture {
    tracing::trace!("sending item to pipeliner worker");

    // If we've made it here, then a semaphore permit has already been
    // acquired, so we can freely allocate a oneshot.
    let (result_tx, result_rx) = oneshot::channel();

    match tx.send(Message {
        item,
        tx: result_tx,
        span,
        _permit: permit,
    }) {
        Err(_) => ResponseFuture::failed(PipelineError::Closed),
        Ok(_) => ResponseFuture::new(result_rx),
    }
}

impl<Item> Service<Item> for Pipeliner<Item>
where
    Item: Send + 'static,
{
    type Response = ();
    type Error = PipelineError;
    type Future = ResponseFuture;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Check to see if the worker has returned or panicked.
        //
        // Correctness: Registers this task for wakeup when the worker finishes.
        if let Some(worker_handle) = self
            .worker_handle
            .lock()
            .expect("previous task panicked while holding the worker handle mutex")
            .as_mut()
        {
            match Pin::new(worker_handle).poll(cx) {
                Poll::Ready(Ok(())) => return Poll::Ready(Err(PipelineError::Closed)),
                Poll::Ready(Err(task_cancelled)) if task_cancelled.is_cancelled() => {
                    tracing::warn!(
                        "pipeliner task cancelled: {task_cancelled}\n\
                         Is the runtime shutting down?"
                    );

                    return Poll::Ready(Err(PipelineError::Closed));
                }
                Poll::Ready(Err(task_panic)) => {
                    std::panic::resume_unwind(task_panic.into_panic());
                }
                Poll::Pending => {}
            }
        }

        // Check if the worker has closed its channel.
        //
        // Correctness: Registers this task for wakeup when the channel is closed.
        let tx = self.tx.clone();
        let closed = tx.closed();
        pin!(closed);
        if closed.poll(cx).is_ready() {
            return Poll::Ready(Err(PipelineError::Closed));
        }

        // Poll to acquire a semaphore permit.
        //
        // CORRECTNESS
        //
        // If we acquire a permit, then there's enough intake capacity to send a new item.
        // Otherwise, we need to wait for capacity. When that happens, `poll_acquire()` registers
        // this task for wakeup when the next permit is available, or when the semaphore is closed.
        //
        // When `poll_ready()` is called multiple times, and channel capacity is 1,
        // avoid deadlocks by dropping any previous permit before acquiring another one.
        self.permit = None;

        let permit = ready!(self.semaphore.poll_acquire(cx));
        if let Some(permit) = permit {
            self.permit = Some(permit);
        } else {
            // The semaphore has been closed.
            return Poll::Ready(Err(PipelineError::Closed));
        }

        Poll::Ready(Ok(()))
    }

    fn call(&mut self, item: Item) -> Self::Future {
        let permit = self
            .permit
            .take()
            .expect("poll_ready must be called before submitting an item");

        send(&self.tx, item, permit, tracing::Span::current())
    }
}

impl<Item> Clone for Pipeliner<Item> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            semaphore: self.semaphore.clone(),
            permit: None,
            worker_handle: self.worker_handle.clone(),
        }
    }
}
