//! Pipeliner worker item handling and run loop implementation.

use std::{
    any::Any,
    fmt, mem,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
};

use futures::{
    future::OptionFuture, stream::FuturesUnordered, FutureExt, StreamExt, TryFutureExt,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{sleep, sleep_until, Sleep},
};
use tokio_util::sync::PollSemaphore;
use tracing_futures::Instrument;

use crate::{
    config::Config,
    doer::{BatchContext, Doer},
    error::{BatchError, PipelineError},
    message::{Message, Tx},
};

/// Task that accumulates submitted items into batches, and dispatches them to
/// the batch function. This type should not be used directly, instead
/// [`Pipeliner::new()`](crate::Pipeliner::new) spawns it on the Tokio runtime.
///
/// The worker is the only owner of the accumulating batch and its timer.
/// Executing batches own their items and result slots until they finish,
/// then return their result slot buffer to the worker for reuse.
pub struct Worker<D, Item>
where
    D: Doer<Item>,
{
    // Batch management
    //
    /// A semaphore-bounded channel for receiving items from the pipeliner handles.
    rx: mpsc::UnboundedReceiver<Message<Item>>,

    /// The batch function, shared with every executing batch.
    doer: Arc<D>,

    /// The items in the accumulating batch, in intake order.
    pending_items: Vec<Item>,

    /// The result slots for the accumulating batch, in the same order as `pending_items`.
    ///
    /// This is `None` when every batch slot is executing. In that case, we stop
    /// taking new items from the intake queue until a batch finishes.
    pending_batch: Option<Vec<Tx>>,

    /// Result slot buffers that are not currently accumulating or executing.
    spare_slots: Vec<Vec<Tx>>,

    /// The timer for the pending batch, if it has any items.
    ///
    /// The timer is started when the first item of a new batch is
    /// submitted, so that the batch latency of all items is at most
    /// `max_latency`. We don't keep the timer running when the batch is
    /// empty, to prevent wakeups on idle pipeliners.
    pending_batch_timer: Option<Pin<Box<Sleep>>>,

    /// The batches that are currently executing.
    ///
    /// Each task returns its emptied result slot buffer when it finishes.
    concurrent_batches: FuturesUnordered<JoinHandle<Vec<Tx>>>,

    /// The identifier for the next flushed batch.
    next_batch_id: u64,

    // Termination
    //
    /// A cloned copy of the pipeliner handles' semaphore, used to close the semaphore.
    close: PollSemaphore,

    // Config
    //
    config: Config,
}

impl<D, Item> Worker<D, Item>
where
    D: Doer<Item>,
    Item: Send + 'static,
{
    /// Creates a new pipeliner worker.
    ///
    /// See [`Pipeliner::new()`](crate::Pipeliner::new) for details.
    pub(crate) fn new(
        doer: D,
        rx: mpsc::UnboundedReceiver<Message<Item>>,
        config: Config,
        close: PollSemaphore,
    ) -> Worker<D, Item> {
        let slots = config.batch_slots();

        // One slot starts accumulating, the rest wait for their turn.
        // Spare slots grow when they are first used, then keep their capacity.
        let spare_slots = (1..slots).map(|_| Vec::new()).collect();

        Worker {
            rx,
            doer: Arc::new(doer),
            pending_items: Vec::with_capacity(config.batch_capacity()),
            pending_batch: Some(Vec::with_capacity(config.batch_capacity())),
            spare_slots,
            pending_batch_timer: None,
            concurrent_batches: FuturesUnordered::new(),
            next_batch_id: 0,
            close,
            config,
        }
    }

    /// Add a single submitted item to the accumulating batch.
    fn process_item(&mut self, msg: Message<Item>) {
        let Message {
            item,
            tx,
            span,
            _permit,
        } = msg;

        let Some(pending_batch) = self.pending_batch.as_mut() else {
            // The run loop only receives items when there is an accumulating batch.
            let _ = tx.send(Err(PipelineError::Closed));
            return;
        };

        span.in_scope(|| tracing::trace!("adding item to pending batch"));

        self.pending_items.push(item);
        pending_batch.push(tx);
    }

    /// Hand the accumulating batch to a new executor task,
    /// and start accumulating into a spare batch slot.
    ///
    /// Does nothing if the accumulating batch is empty.
    fn flush(&mut self) {
        self.pending_batch_timer = None;

        if self.pending_items.is_empty() {
            tracing::trace!("pending batch is empty, skipping flush");
            return;
        }

        let Some(responders) = self.pending_batch.take() else {
            return;
        };

        let items = mem::replace(
            &mut self.pending_items,
            Vec::with_capacity(self.config.batch_capacity()),
        );

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let ctx = BatchContext::new(batch_id, items.len(), self.config.effective_timeout());
        let span = tracing::debug_span!("batch", batch_id, items = items.len());

        metrics::counter!("pipeliner.batches.flushed").increment(1);
        metrics::counter!("pipeliner.items.flushed").increment(items.len() as u64);

        let batch = run_batch(self.doer.clone(), ctx, items, responders).instrument(span);
        self.concurrent_batches.push(tokio::spawn(batch));

        metrics::gauge!("pipeliner.batches.running").set(self.concurrent_batches.len() as f64);

        // This is `None` when every slot is executing, which pauses intake.
        self.pending_batch = self.spare_slots.pop();
    }

    /// Return the result slot buffer of a finished batch to the worker.
    fn recycle_slot(&mut self, mut slot: Vec<Tx>) {
        slot.clear();

        metrics::gauge!("pipeliner.batches.running").set(self.concurrent_batches.len() as f64);

        if self.pending_batch.is_none() {
            tracing::trace!("batch slot available, resuming intake");
            self.pending_batch = Some(slot);
        } else {
            self.spare_slots.push(slot);
        }
    }

    /// Run loop for submitted items, which implements the batch policies.
    ///
    /// See [`Pipeliner::new()`](crate::Pipeliner::new) for details.
    pub async fn run(mut self) {
        loop {
            // Wait on a finished batch, the batch timer, or a new item.
            //
            // If several are ready, free batch slots first, then end the batch if
            // the timer has elapsed. If the timer elapses, any pending messages are preserved:
            // https://docs.rs/tokio/latest/tokio/sync/mpsc/struct.UnboundedReceiver.html#cancel-safety
            tokio::select! {
                biased;

                finished = self.concurrent_batches.next(), if !self.concurrent_batches.is_empty() => {
                    let slot = match finished.expect("only returns None when empty") {
                        Ok(slot) => slot,
                        Err(task_error) => {
                            // The batch task was cancelled, so its slot is lost.
                            tracing::debug!(?task_error, "batch task failed, replacing its slot");
                            Vec::with_capacity(self.config.batch_capacity())
                        }
                    };

                    tracing::trace!(
                        pending_items = self.pending_items.len(),
                        batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                        running_batches = self.concurrent_batches.len(),
                        "batch finished executing",
                    );

                    self.recycle_slot(slot);
                },

                Some(()) = OptionFuture::from(self.pending_batch_timer.as_mut()), if self.pending_batch_timer.is_some() => {
                    tracing::trace!(
                        pending_items = self.pending_items.len(),
                        batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                        running_batches = self.concurrent_batches.len(),
                        "batch timer expired",
                    );

                    self.flush();
                },

                maybe_msg = self.rx.recv(), if self.pending_batch.is_some() => match maybe_msg {
                    Some(msg) => {
                        tracing::trace!(
                            pending_items = self.pending_items.len(),
                            batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                            running_batches = self.concurrent_batches.len(),
                            "batch item received",
                        );

                        self.process_item(msg);

                        let pending_items = self.pending_items.len();
                        let max_items = self.config.max_items_in_batch;

                        if max_items > 0 && pending_items >= max_items {
                            tracing::trace!(
                                pending_items,
                                running_batches = self.concurrent_batches.len(),
                                "batch is full",
                            );

                            self.flush();
                        } else if pending_items == 1 && !self.config.max_latency.is_zero() {
                            tracing::trace!(
                                pending_items,
                                running_batches = self.concurrent_batches.len(),
                                "batch is new, starting timer",
                            );

                            // The first item in a new batch.
                            self.pending_batch_timer = Some(Box::pin(sleep(self.config.max_latency)));
                        } else {
                            tracing::trace!(
                                pending_items,
                                batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
                                running_batches = self.concurrent_batches.len(),
                                "waiting for full batch or batch timer",
                            );
                        }
                    }
                    None => {
                        tracing::trace!("pipeliner channel closed and emptied, flushing final batch");

                        self.flush();

                        while let Some(finished) = self.concurrent_batches.next().await {
                            if let Err(task_error) = finished {
                                tracing::debug!(?task_error, "batch task failed during shutdown");
                            }
                        }

                        tracing::trace!("all batches finished, exiting worker task");

                        return;
                    }
                },
            }
        }
    }
}

/// Run the batch function on one batch, then send its result to every item in the batch.
///
/// Returns the emptied result slot buffer, so the worker can reuse it.
async fn run_batch<D, Item>(
    doer: Arc<D>,
    ctx: BatchContext,
    items: Vec<Item>,
    mut responders: Vec<Tx>,
) -> Vec<Tx>
where
    D: Doer<Item>,
{
    let result = execute(&*doer, ctx, items).await;

    match &result {
        Ok(()) => tracing::trace!("batch succeeded"),
        Err(PipelineError::Panicked(panic)) => {
            tracing::warn!(?panic, "batch function panicked");
            metrics::counter!("pipeliner.batches.panicked").increment(1);
        }
        Err(error) => {
            tracing::debug!(?error, "batch failed");
            metrics::counter!("pipeliner.batches.failed").increment(1);
        }
    }

    for tx in responders.drain(..) {
        // The caller may have stopped waiting for the result.
        let _ = tx.send(result.clone());
    }

    responders
}

/// Call the batch function, enforcing its cooperative deadline,
/// and converting panics into errors.
async fn execute<D, Item>(
    doer: &D,
    ctx: BatchContext,
    items: Vec<Item>,
) -> Result<(), PipelineError>
where
    D: Doer<Item>,
{
    let deadline = ctx.deadline();
    let cancel = ctx.cancel_token();

    let batch = match std::panic::catch_unwind(AssertUnwindSafe(|| doer.call(ctx, items))) {
        Ok(batch) => batch,
        Err(panic) => return Err(PipelineError::Panicked(panic_message(&*panic))),
    };

    let batch = AssertUnwindSafe(
        batch.map_err(|error| PipelineError::Batch(BatchError::new(error.into()))),
    )
    .catch_unwind();
    tokio::pin!(batch);

    let outcome = match deadline {
        Some(deadline) => {
            tokio::select! {
                outcome = &mut batch => outcome,
                () = sleep_until(deadline) => {
                    tracing::debug!("batch timeout expired, signalling batch function");
                    cancel.cancel();

                    // The deadline is cooperative, so we still wait for the batch result.
                    batch.await
                }
            }
        }
        None => batch.await,
    };

    outcome.unwrap_or_else(|panic| Err(PipelineError::Panicked(panic_message(&*panic))))
}

/// Returns the message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "<non string panic payload>".to_string())
}

impl<D, Item> fmt::Debug for Worker<D, Item>
where
    D: Doer<Item>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = std::any::type_name::<Self>();
        f.debug_struct(name)
            .field("pending_items", &self.pending_items.len())
            .field("accumulating", &self.pending_batch.is_some())
            .field("spare_slots", &self.spare_slots.len())
            .field("running_batches", &self.concurrent_batches.len())
            .field("next_batch_id", &self.next_batch_id)
            .field("config", &self.config)
            .finish()
    }
}

impl<D, Item> Drop for Worker<D, Item>
where
    D: Doer<Item>,
{
    fn drop(&mut self) {
        tracing::trace!(
            pending_items = self.pending_items.len(),
            batch_deadline = ?self.pending_batch_timer.as_ref().map(|sleep| sleep.deadline()),
            running_batches = self.concurrent_batches.len(),
            "dropping pipeliner worker",
        );

        // Stop new items, and wake handles waiting for intake capacity.
        self.rx.close();
        self.close.close();

        // Fail items in the unflushed batch
        if let Some(pending_batch) = self.pending_batch.as_mut() {
            for tx in pending_batch.drain(..) {
                let _ = tx.send(Err(PipelineError::Closed));
            }
        }

        // Fail queued items
        while let Ok(msg) = self.rx.try_recv() {
            let _ = msg.tx.send(Err(PipelineError::Closed));
        }

        // Executing batches keep running, and deliver their own results.
    }
}
