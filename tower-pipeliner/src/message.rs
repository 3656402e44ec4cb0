use tokio::sync::{oneshot, OwnedSemaphorePermit};

use crate::error::PipelineError;

/// Message sent to the pipeliner worker
#[derive(Debug)]
pub(crate) struct Message<Item> {
    pub(crate) item: Item,
    pub(crate) tx: Tx,
    pub(crate) span: tracing::Span,
    /// Released when the worker takes the item off the intake queue.
    pub(crate) _permit: OwnedSemaphorePermit,
}

/// The single-use result slot for one submitted item.
pub(crate) type Tx = oneshot::Sender<Result<(), PipelineError>>;

/// Receives the result of the batch containing one submitted item.
pub(crate) type Rx = oneshot::Receiver<Result<(), PipelineError>>;
