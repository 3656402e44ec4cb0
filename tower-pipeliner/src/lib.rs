//! Tower middleware for coalescing concurrent calls into batches
//!
//! This crate provides a [`Pipeliner`] that accepts single items from any
//! number of concurrent callers, groups them into batches, and runs a
//! caller-supplied batch function (a [`Doer`]) once per batch. Every caller
//! waits until the batch containing its item has been processed, and then
//! receives the batch function's result.
//!
//! ## Example: coalescing writes
//!
//! Backing stores usually handle one bulk operation much more efficiently than
//! many small ones. But the code that produces writes is often spread across
//! many tasks, each of which wants to know when *its* write has been stored.
//!
//! Rather than assembling bulk writes by hand, each task can submit its own
//! write to a shared `Pipeliner`, and wait on the result. The pipeliner turns
//! the contemporaneous writes into one bulk call, and hands the bulk call's
//! result back to every task that contributed to it.
//!
//! ## Batch policy
//!
//! The pipeliner manages the latency/throughput tradeoff of batching with two
//! flush triggers, configured together with [`Config::with_window`]:
//!
//! - a batch is flushed as soon as it has `max_items_in_batch` items, and
//! - a batch is flushed `max_latency` after its first item arrived.
//!
//! At least one of them must be set. Items are passed to the batch function
//! in the order the pipeliner received them.
//!
//! Executing batches are bounded by `max_concurrent_batches`. When every batch
//! slot is executing, the pipeliner stops accepting new items until a batch
//! finishes, and callers wait for intake capacity. This bounds memory use
//! when the batch function is slower than the callers.
//!
//! ## Errors
//!
//! The batch function returns one result for the whole batch. Every caller in
//! a failed batch gets a clone of the same [`BatchError`], so callers can tell
//! which failures were shared. The pipeliner does not retry batches, or split
//! failed batches into individual items. That can be done by the caller, for
//! example by composing the [`Pipeliner`] service with a retry layer.
//!
//! If the batch function panics, every caller in that batch gets a
//! [`PipelineError::Panicked`] error, and the pipeliner keeps running.
//!
//! ## Tower integration
//!
//! [`Pipeliner`] implements [`tower::Service`], applying intake backpressure
//! in `poll_ready`, and [`PipelinerLayer`] builds a pipeliner from a batch
//! function. Callers that don't use Tower can call [`Pipeliner::submit`].

pub mod config;
pub mod doer;
pub mod error;
pub mod future;
mod layer;
mod message;
mod service;
mod worker;

/// A type-erased error returned by batch functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub use self::{
    config::Config,
    doer::{doer_fn, doer_fn_with_context, BatchContext, Doer},
    error::{BatchError, ConfigError, PipelineError},
    layer::PipelinerLayer,
    service::Pipeliner,
    worker::Worker,
};
